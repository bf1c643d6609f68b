//! Test fixtures for creating test data.
//!
//! These fixtures go through the store traits directly, bypassing crawls.

use anyhow::Result;
use application_engine::common::JobId;
use application_engine::domains::jobs::{JobSource, NewPosting};
use application_engine::kernel::test_dependencies::MockSourceAdapter;
use application_engine::kernel::JobStore;

/// A posting as a source adapter would report it
pub fn posting(source: JobSource, external_id: &str) -> NewPosting {
    MockSourceAdapter::posting(source, external_id)
}

/// Register an active posting and return its id
pub async fn create_test_job(store: &dyn JobStore, external_id: &str) -> Result<JobId> {
    let outcome = store
        .upsert_job(&posting(JobSource::Linkedin, external_id))
        .await?;
    Ok(outcome.job_id)
}

/// An adapter serving `pages`, each a list of external ids
pub fn adapter_with_pages(source: JobSource, pages: &[&[&str]]) -> MockSourceAdapter {
    pages
        .iter()
        .fold(MockSourceAdapter::new(source), |adapter, ids| {
            adapter.with_page(ids.to_vec())
        })
}

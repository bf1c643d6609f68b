use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};

use super::models::{JobPosting, JobSearch, JobSource, NewPosting, UpsertOutcome};
use crate::common::JobId;
use crate::kernel::JobStore;

/// Deduplicating registry of discovered postings.
///
/// Deduplication happens in the store as one atomic insert-or-refresh, so
/// concurrent crawls that observe the same posting converge on one row.
#[derive(Clone)]
pub struct JobRegistry {
    store: Arc<dyn JobStore>,
}

impl JobRegistry {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub async fn upsert(&self, posting: &NewPosting) -> Result<UpsertOutcome> {
        let outcome = self.store.upsert_job(posting).await?;
        tracing::trace!(
            job_id = %outcome.job_id,
            source = %posting.source,
            external_id = %posting.external_id,
            is_new = outcome.is_new,
            "Upserted posting"
        );
        Ok(outcome)
    }

    pub async fn get(&self, id: JobId) -> Result<Option<JobPosting>> {
        self.store.get_job(id).await
    }

    pub async fn search(&self, search: &JobSearch) -> Result<Vec<JobPosting>> {
        self.store.search_jobs(search).await
    }

    /// Mark postings of `source` unseen since `cutoff` inactive.
    pub async fn deactivate_stale(&self, source: JobSource, cutoff: DateTime<Utc>) -> Result<u64> {
        let count = self.store.deactivate_stale_jobs(source, cutoff).await?;
        if count > 0 {
            tracing::info!(source = %source, count, "Deactivated stale postings");
        }
        Ok(count)
    }
}

//! Storage traits.
//!
//! Each concern gets its own trait so components depend only on the tables
//! they touch. Uniqueness and status preconditions are enforced here, at the
//! storage layer: `upsert_job` is an atomic insert-or-refresh keyed on
//! (source, external_id), `insert_application` never creates a second row for
//! a (user, job) pair, and every application status write is a
//! compare-and-set on the current status.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::common::{ApplicationId, CrawlRequestId, JobId, UserId};
use crate::domains::applications::{
    Application, ApplicationFilter, ApplicationStats, ApplicationStatus, DeleteOutcome,
    InsertOutcome, StatusChange,
};
use crate::domains::crawling::{CrawlProgress, CrawlRequest, CrawlStatus};
use crate::domains::jobs::{JobPosting, JobSearch, JobSource, NewPosting, UpsertOutcome};
use crate::domains::metering::{UsageRecord, UsageStats};

// ============================================================================
// JOBS
// ============================================================================

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert the posting, or refresh the existing (source, external_id) row.
    async fn upsert_job(&self, posting: &NewPosting) -> Result<UpsertOutcome>;

    async fn get_job(&self, id: JobId) -> Result<Option<JobPosting>>;

    async fn search_jobs(&self, search: &JobSearch) -> Result<Vec<JobPosting>>;

    /// Mark postings of `source` not seen since `cutoff` inactive. Returns the
    /// number of rows changed.
    async fn deactivate_stale_jobs(&self, source: JobSource, cutoff: DateTime<Utc>)
        -> Result<u64>;
}

// ============================================================================
// CRAWL REQUESTS
// ============================================================================

#[async_trait]
pub trait CrawlStore: Send + Sync {
    async fn insert_crawl_request(&self, request: &CrawlRequest) -> Result<()>;

    async fn get_crawl_request(&self, id: CrawlRequestId) -> Result<Option<CrawlRequest>>;

    /// Most recent first.
    async fn list_crawl_requests(&self, limit: i64) -> Result<Vec<CrawlRequest>>;

    /// Conditional status write. Stamps `started_at` on `running` and
    /// `completed_at` on terminal statuses. Returns false if the row was not in
    /// `from`.
    async fn transition_crawl_request(
        &self,
        id: CrawlRequestId,
        from: CrawlStatus,
        to: CrawlStatus,
        error_message: Option<String>,
    ) -> Result<bool>;

    async fn record_crawl_progress(&self, id: CrawlRequestId, progress: CrawlProgress)
        -> Result<()>;

    /// Fail every `queued` or `running` request. Used at startup for requests
    /// orphaned by a previous process. Returns the number of rows changed.
    async fn fail_unfinished_crawls(&self, error_message: &str) -> Result<u64>;
}

// ============================================================================
// APPLICATIONS
// ============================================================================

#[async_trait]
pub trait ApplicationStore: Send + Sync {
    /// Insert a new row unless one exists for the same (user, job).
    async fn insert_application(&self, application: &Application) -> Result<InsertOutcome>;

    async fn get_application(&self, id: ApplicationId) -> Result<Option<Application>>;

    async fn find_application(&self, user_id: UserId, job_id: JobId)
        -> Result<Option<Application>>;

    /// Apply `change` only if the row is currently `expected`. Returns the
    /// updated row, or `None` if the row is missing or in another status.
    async fn transition_application(
        &self,
        id: ApplicationId,
        expected: ApplicationStatus,
        change: &StatusChange,
    ) -> Result<Option<Application>>;

    /// Delete the row only if its status is one of `allowed`.
    async fn delete_application_if(
        &self,
        id: ApplicationId,
        allowed: &[ApplicationStatus],
    ) -> Result<DeleteOutcome>;

    async fn set_fit_score(&self, id: ApplicationId, score: f32) -> Result<()>;

    async fn list_applications(&self, filter: &ApplicationFilter) -> Result<Vec<Application>>;

    /// All rows in `status`, oldest first. Used by startup recovery.
    async fn applications_with_status(&self, status: ApplicationStatus)
        -> Result<Vec<Application>>;

    async fn application_stats(&self, user_id: UserId) -> Result<ApplicationStats>;
}

// ============================================================================
// USAGE
// ============================================================================

#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn insert_usage(&self, record: &UsageRecord) -> Result<()>;

    /// Aggregate usage of `user_id`; records at or after `day_start` count
    /// towards the "today" figures.
    async fn usage_stats(&self, user_id: UserId, day_start: DateTime<Utc>) -> Result<UsageStats>;
}

/// Everything the engine persists.
pub trait Store: JobStore + CrawlStore + ApplicationStore + UsageStore {}

impl<T> Store for T where T: JobStore + CrawlStore + ApplicationStore + UsageStore {}

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::common::{CrawlRequestId, UserId};
use crate::domains::jobs::{JobSource, NewPosting};

/// Lifecycle of a crawl request.
///
/// `queued → running → {completed, failed, cancelled}`, or `queued → cancelled`
/// when cancelled before it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "crawl_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CrawlStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl CrawlStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CrawlStatus::Completed | CrawlStatus::Failed | CrawlStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: CrawlStatus) -> bool {
        matches!(
            (self, next),
            (CrawlStatus::Queued, CrawlStatus::Running)
                | (CrawlStatus::Queued, CrawlStatus::Cancelled)
                | (CrawlStatus::Running, CrawlStatus::Completed)
                | (CrawlStatus::Running, CrawlStatus::Failed)
                | (CrawlStatus::Running, CrawlStatus::Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CrawlStatus::Queued => "queued",
            CrawlStatus::Running => "running",
            CrawlStatus::Completed => "completed",
            CrawlStatus::Failed => "failed",
            CrawlStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for CrawlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One triggered crawl. History is immutable once terminal.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct CrawlRequest {
    pub id: CrawlRequestId,
    pub user_id: Option<UserId>,
    pub search_query: String,
    pub location: Option<String>,
    pub source: JobSource,
    pub status: CrawlStatus,
    /// Postings observed, new or already known
    pub jobs_found: i32,
    /// Postings first discovered by this request
    pub jobs_new: i32,
    pub pages_fetched: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl CrawlRequest {
    pub fn queued(
        user_id: Option<UserId>,
        search_query: impl Into<String>,
        location: Option<String>,
        source: JobSource,
    ) -> Self {
        Self {
            id: CrawlRequestId::new(),
            user_id,
            search_query: search_query.into(),
            location,
            source,
            status: CrawlStatus::Queued,
            jobs_found: 0,
            jobs_new: 0,
            pages_fetched: 0,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// Counters persisted after each page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrawlProgress {
    pub jobs_found: i32,
    pub jobs_new: i32,
    pub pages_fetched: i32,
}

/// Opaque cursor handed back to the adapter to fetch the next page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageToken(pub String);

impl PageToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One page of adapter results.
#[derive(Debug, Clone, Default)]
pub struct FetchedPage {
    pub postings: Vec<NewPosting>,
    /// `None` when the listing is exhausted
    pub next_page: Option<PageToken>,
}

/// What `cancel` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The request had not started and is now `cancelled`
    CancelledBeforeStart,
    /// The request is running; it stops at the next page boundary
    CancellationRequested,
    /// The request already finished with this status
    AlreadyFinished(CrawlStatus),
}

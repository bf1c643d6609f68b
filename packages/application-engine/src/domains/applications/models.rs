use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::common::{ApplicationId, JobId, UserId};

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "application_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    /// Created or re-queued, not yet picked up by a worker
    Pending,
    /// An attempt is running
    InProgress,
    /// Submitted successfully
    Applied,
    /// Last attempt ended in error; re-attemptable
    Failed,
    Rejected,
    Interview,
    Accepted,
}

impl ApplicationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationStatus::Pending => "pending",
            ApplicationStatus::InProgress => "in_progress",
            ApplicationStatus::Applied => "applied",
            ApplicationStatus::Failed => "failed",
            ApplicationStatus::Rejected => "rejected",
            ApplicationStatus::Interview => "interview",
            ApplicationStatus::Accepted => "accepted",
        }
    }
}

impl fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Downstream outcome reported by the user or the employer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackSignal {
    Interview,
    Rejected,
    Accepted,
}

impl From<FeedbackSignal> for ApplicationStatus {
    fn from(signal: FeedbackSignal) -> Self {
        match signal {
            FeedbackSignal::Interview => ApplicationStatus::Interview,
            FeedbackSignal::Rejected => ApplicationStatus::Rejected,
            FeedbackSignal::Accepted => ApplicationStatus::Accepted,
        }
    }
}

// ============================================================================
// Application
// ============================================================================

/// One user's attempts to apply to one posting. Unique per (user, job).
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub id: ApplicationId,
    pub user_id: UserId,
    pub job_id: JobId,
    pub status: ApplicationStatus,
    pub attempt_count: i32,
    pub error_message: Option<String>,
    pub diagnostic_ref: Option<String>,
    pub fit_score: Option<f32>,
    pub automation_log: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub applied_at: Option<DateTime<Utc>>,
}

impl Application {
    pub fn pending(user_id: UserId, job_id: JobId) -> Self {
        let now = Utc::now();
        Self {
            id: ApplicationId::new(),
            user_id,
            job_id,
            status: ApplicationStatus::Pending,
            attempt_count: 0,
            error_message: None,
            diagnostic_ref: None,
            fit_score: None,
            automation_log: Vec::new(),
            created_at: now,
            updated_at: now,
            last_attempt_at: None,
            applied_at: None,
        }
    }

    /// Apply a status change in place. Stores call this under their row lock
    /// after checking the expected status.
    pub fn apply_change(&mut self, change: &StatusChange, now: DateTime<Utc>) {
        self.status = change.to;
        if change.write_failure {
            self.error_message = change.error_message.clone();
            self.diagnostic_ref = change.diagnostic_ref.clone();
        }
        if let Some(log) = &change.automation_log {
            self.automation_log = log.clone();
        }
        if change.begin_attempt {
            self.attempt_count += 1;
            self.last_attempt_at = Some(now);
        }
        if change.mark_applied {
            self.applied_at = Some(now);
        }
        self.updated_at = now;
    }
}

/// A conditional status write: applied only if the row is still in the
/// expected status.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub to: ApplicationStatus,
    /// Overwrite `error_message`/`diagnostic_ref` with the values below
    pub write_failure: bool,
    pub error_message: Option<String>,
    pub diagnostic_ref: Option<String>,
    /// Replace the automation log when set
    pub automation_log: Option<Vec<String>>,
    /// Increment `attempt_count` and stamp `last_attempt_at`
    pub begin_attempt: bool,
    /// Stamp `applied_at`
    pub mark_applied: bool,
}

impl StatusChange {
    fn to(status: ApplicationStatus) -> Self {
        Self {
            to: status,
            write_failure: false,
            error_message: None,
            diagnostic_ref: None,
            automation_log: None,
            begin_attempt: false,
            mark_applied: false,
        }
    }

    /// `FAILED → PENDING`: clear the previous attempt's failure details.
    pub fn requeue() -> Self {
        Self {
            write_failure: true,
            automation_log: Some(Vec::new()),
            ..Self::to(ApplicationStatus::Pending)
        }
    }

    /// `PENDING → IN_PROGRESS`.
    pub fn begin_attempt() -> Self {
        Self {
            begin_attempt: true,
            ..Self::to(ApplicationStatus::InProgress)
        }
    }

    /// `IN_PROGRESS → APPLIED`.
    pub fn succeeded(log: Vec<String>) -> Self {
        Self {
            write_failure: true,
            automation_log: Some(log),
            mark_applied: true,
            ..Self::to(ApplicationStatus::Applied)
        }
    }

    /// `IN_PROGRESS → FAILED`.
    pub fn failed(
        message: impl Into<String>,
        diagnostic_ref: Option<String>,
        log: Vec<String>,
    ) -> Self {
        Self {
            write_failure: true,
            error_message: Some(message.into()),
            diagnostic_ref,
            automation_log: Some(log),
            ..Self::to(ApplicationStatus::Failed)
        }
    }

    /// Feedback states keep everything but the status.
    pub fn feedback(signal: FeedbackSignal) -> Self {
        Self::to(signal.into())
    }
}

// ============================================================================
// Outcomes and queries
// ============================================================================

/// Result of inserting a new application row.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Inserted(Application),
    /// A row for the (user, job) pair already existed
    Existing(Application),
}

/// Result of a conditional delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
    /// The row exists in a status that forbids deletion
    Rejected(ApplicationStatus),
}

/// What an `apply` call did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// A new application row was created and queued
    Created {
        application_id: ApplicationId,
        status: ApplicationStatus,
    },
    /// A failed application was reset to pending and queued again
    Requeued {
        application_id: ApplicationId,
        status: ApplicationStatus,
    },
    /// An attempt is queued, running or already succeeded; nothing was done
    AlreadyActive {
        application_id: ApplicationId,
        status: ApplicationStatus,
    },
}

impl ApplyOutcome {
    pub fn application_id(&self) -> ApplicationId {
        match self {
            ApplyOutcome::Created { application_id, .. }
            | ApplyOutcome::Requeued { application_id, .. }
            | ApplyOutcome::AlreadyActive { application_id, .. } => *application_id,
        }
    }

    pub fn status(&self) -> ApplicationStatus {
        match self {
            ApplyOutcome::Created { status, .. }
            | ApplyOutcome::Requeued { status, .. }
            | ApplyOutcome::AlreadyActive { status, .. } => *status,
        }
    }

    /// True when this call enqueued a new attempt.
    pub fn enqueued(&self) -> bool {
        !matches!(self, ApplyOutcome::AlreadyActive { .. })
    }
}

/// Status snapshot returned to callers.
#[derive(Debug, Clone, Serialize)]
pub struct ApplicationStatusView {
    pub application_id: ApplicationId,
    pub status: ApplicationStatus,
    pub attempt_count: i32,
    pub error_message: Option<String>,
    pub diagnostic_ref: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub applied_at: Option<DateTime<Utc>>,
}

impl From<&Application> for ApplicationStatusView {
    fn from(app: &Application) -> Self {
        Self {
            application_id: app.id,
            status: app.status,
            attempt_count: app.attempt_count,
            error_message: app.error_message.clone(),
            diagnostic_ref: app.diagnostic_ref.clone(),
            last_attempt_at: app.last_attempt_at,
            applied_at: app.applied_at,
        }
    }
}

pub const DEFAULT_PAGE_SIZE: i64 = 20;
pub const MAX_PAGE_SIZE: i64 = 100;

/// Listing filter for one user's applications, newest first.
#[derive(Debug, Clone)]
pub struct ApplicationFilter {
    pub user_id: UserId,
    pub status: Option<ApplicationStatus>,
    pub offset: i64,
    pub limit: i64,
}

impl ApplicationFilter {
    pub fn for_user(user_id: UserId) -> Self {
        Self {
            user_id,
            status: None,
            offset: 0,
            limit: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_status(mut self, status: ApplicationStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn page(mut self, offset: i64, limit: i64) -> Self {
        self.offset = offset.max(0);
        self.limit = limit.clamp(1, MAX_PAGE_SIZE);
        self
    }
}

/// Per-user counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ApplicationStats {
    pub total: i64,
    pub pending: i64,
    pub in_progress: i64,
    pub applied: i64,
    pub interviews: i64,
    pub failed: i64,
    /// `applied / total * 100`, zero when there are no applications
    pub success_rate: f64,
}

impl ApplicationStats {
    pub fn with_success_rate(mut self) -> Self {
        self.success_rate = if self.total > 0 {
            self.applied as f64 / self.total as f64 * 100.0
        } else {
            0.0
        };
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_then_requeue_clears_failure_details() {
        let mut app = Application::pending(UserId::new(), JobId::new());
        let now = Utc::now();
        app.apply_change(&StatusChange::begin_attempt(), now);
        app.apply_change(
            &StatusChange::failed("boom", Some("artifact-1".into()), vec!["navigate".into()]),
            now,
        );
        assert_eq!(app.status, ApplicationStatus::Failed);
        assert_eq!(app.attempt_count, 1);
        assert_eq!(app.diagnostic_ref.as_deref(), Some("artifact-1"));

        app.apply_change(&StatusChange::requeue(), now);
        assert_eq!(app.status, ApplicationStatus::Pending);
        assert!(app.error_message.is_none());
        assert!(app.diagnostic_ref.is_none());
        assert!(app.automation_log.is_empty());
        assert_eq!(app.attempt_count, 1);
    }

    #[test]
    fn feedback_keeps_applied_at() {
        let mut app = Application::pending(UserId::new(), JobId::new());
        let now = Utc::now();
        app.apply_change(&StatusChange::begin_attempt(), now);
        app.apply_change(&StatusChange::succeeded(vec![]), now);
        let applied_at = app.applied_at;
        assert!(applied_at.is_some());

        app.apply_change(&StatusChange::feedback(FeedbackSignal::Interview), now);
        assert_eq!(app.status, ApplicationStatus::Interview);
        assert_eq!(app.applied_at, applied_at);
    }

    #[test]
    fn success_rate() {
        let stats = ApplicationStats {
            total: 4,
            applied: 1,
            ..Default::default()
        }
        .with_success_rate();
        assert_eq!(stats.success_rate, 25.0);
        assert_eq!(ApplicationStats::default().with_success_rate().success_rate, 0.0);
    }

    #[test]
    fn filter_page_is_clamped() {
        let filter = ApplicationFilter::for_user(UserId::new()).page(-1, 500);
        assert_eq!(filter.offset, 0);
        assert_eq!(filter.limit, MAX_PAGE_SIZE);
    }
}

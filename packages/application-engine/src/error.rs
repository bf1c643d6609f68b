//! Error taxonomy for the orchestration engine.
//!
//! Source adapters and automation steps classify their failures as transient
//! or permanent; the crawl scheduler and the submission pipeline decide what to
//! do with each class. `EngineError` is what the exposed operations return.

use std::any::Any;
use std::time::Duration;

use thiserror::Error;

use crate::domains::applications::ApplicationStatus;
use crate::domains::jobs::JobSource;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors returned by the engine's exposed operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The referenced entity does not exist (or is no longer active)
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A concurrent writer changed the row first
    #[error("application {id} changed concurrently (now {status})")]
    Conflict { id: String, status: ApplicationStatus },

    /// Deletion attempted on a live or successful application
    #[error("cannot delete application {id} while it is {status}")]
    DeletionRejected { id: String, status: ApplicationStatus },

    /// Status change not allowed by the state machine
    #[error("invalid application transition from {from} to {to}")]
    InvalidTransition {
        from: ApplicationStatus,
        to: ApplicationStatus,
    },

    /// No adapter is registered for the requested source
    #[error("no source adapter registered for {0}")]
    UnsupportedSource(JobSource),

    /// The automation session pool is saturated
    #[error(transparent)]
    ResourceExhausted(#[from] ResourceExhausted),

    /// Storage or infrastructure failure
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

/// Failure raised by a source adapter while fetching a page.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CrawlAdapterError {
    /// Network error, timeout, throttling
    #[error("transient source error: {0}")]
    Transient(String),

    /// Unparsable or rejected response; retrying will not help
    #[error("permanent source error: {0}")]
    Permanent(String),
}

impl CrawlAdapterError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CrawlAdapterError::Transient(_))
    }
}

/// Failure raised by one automation step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AutomationStepError {
    /// Element not yet rendered, navigation timeout, step timeout
    #[error("{0}")]
    Transient(String),

    /// Form structure unrecognized, bot challenge, missing input data
    #[error("{0}")]
    Permanent(String),
}

impl AutomationStepError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AutomationStepError::Transient(_))
    }

    pub fn element_not_rendered(selector: &str) -> Self {
        AutomationStepError::Transient(format!("element not rendered: {selector}"))
    }

    pub fn navigation_timeout(url: &str) -> Self {
        AutomationStepError::Transient(format!("navigation timed out: {url}"))
    }

    pub fn form_unrecognized(detail: &str) -> Self {
        AutomationStepError::Permanent(format!("form structure unrecognized: {detail}"))
    }

    pub fn bot_challenge(detail: &str) -> Self {
        AutomationStepError::Permanent(format!("bot challenge detected: {detail}"))
    }
}

/// The session pool stayed saturated for the whole acquisition timeout.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "automation capacity exhausted: no session available within {:?} (capacity {}); retry later",
    .waited,
    .capacity
)]
pub struct ResourceExhausted {
    pub capacity: usize,
    pub waited: Duration,
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_error_constructors_classify() {
        assert!(AutomationStepError::element_not_rendered("#email").is_transient());
        assert!(AutomationStepError::navigation_timeout("https://x").is_transient());
        assert!(!AutomationStepError::form_unrecognized("no submit button").is_transient());
        assert!(!AutomationStepError::bot_challenge("captcha").is_transient());
    }

    #[test]
    fn resource_exhausted_message_advises_retry() {
        let err = ResourceExhausted {
            capacity: 5,
            waited: Duration::from_millis(250),
        };
        let msg = err.to_string();
        assert!(msg.contains("capacity exhausted"));
        assert!(msg.contains("250ms"));
        assert!(msg.contains("retry later"));
    }

    #[test]
    fn deletion_rejected_names_status() {
        let err = EngineError::DeletionRejected {
            id: "abc".into(),
            status: ApplicationStatus::InProgress,
        };
        assert_eq!(
            err.to_string(),
            "cannot delete application abc while it is in_progress"
        );
    }

    #[test]
    fn panic_message_reads_str_and_string_payloads() {
        let payload = std::panic::catch_unwind(|| panic!("static message")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static message");

        let payload = std::panic::catch_unwind(|| panic!("formatted {}", 42)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "formatted 42");
    }
}

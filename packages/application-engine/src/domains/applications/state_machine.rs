//! Transition rules for applications.
//!
//! ```text
//!            apply                 worker claim              success
//! (none) ───────────► PENDING ─────────────────► IN_PROGRESS ────────► APPLIED
//!                        ▲                          │                    │ feedback
//!                        │ apply / retry            │ failure            ▼
//!                        └────────────────────── FAILED        INTERVIEW / REJECTED / ACCEPTED
//! ```
//!
//! The rules here are pure; stores enforce them with conditional writes.
//! Feedback states are set only through the external-signal boundary
//! (`record_feedback`), never by the submission pipeline.

use super::models::ApplicationStatus;
use crate::error::{EngineError, Result};

use ApplicationStatus::*;

/// What an `apply` request should do given the existing row's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyDecision {
    /// No row yet: create one in `PENDING` and enqueue
    Create,
    /// Row is `FAILED`: move it back to `PENDING` and enqueue
    Requeue,
    /// An attempt is queued, running, or already succeeded
    NoOp,
}

pub fn decide_apply(existing: Option<ApplicationStatus>) -> ApplyDecision {
    match existing {
        None => ApplyDecision::Create,
        Some(Failed) => ApplyDecision::Requeue,
        Some(Pending | InProgress | Applied | Rejected | Interview | Accepted) => {
            ApplyDecision::NoOp
        }
    }
}

pub fn can_transition(from: ApplicationStatus, to: ApplicationStatus) -> bool {
    matches!(
        (from, to),
        (Pending, InProgress)
            | (InProgress, Applied)
            | (InProgress, Failed)
            | (Failed, Pending)
            | (Applied, Interview)
            | (Applied, Rejected)
            | (Applied, Accepted)
            | (Interview, Rejected)
            | (Interview, Accepted)
    )
}

pub fn ensure_transition(from: ApplicationStatus, to: ApplicationStatus) -> Result<()> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition { from, to })
    }
}

/// Statuses a user may delete from.
pub const DELETABLE: [ApplicationStatus; 2] = [Pending, Failed];

pub fn can_delete(status: ApplicationStatus) -> bool {
    DELETABLE.contains(&status)
}

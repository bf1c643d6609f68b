use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AutomationStepError;
use crate::kernel::SiteCredentials;

/// One labelled input on an application form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormField {
    pub name: String,
    pub value: String,
}

impl FormField {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A concrete browser action, resolved from a step and the applicant's data.
#[derive(Debug, Clone)]
pub enum StepAction {
    Navigate {
        url: String,
        /// Login for the job board, when the applicant has one on file
        credentials: Option<SiteCredentials>,
    },
    FillForm { fields: Vec<FormField> },
    AttachResume { resume_ref: String },
    Submit,
    VerifyConfirmation,
}

impl StepAction {
    pub fn name(&self) -> &'static str {
        match self {
            StepAction::Navigate { .. } => "navigate",
            StepAction::FillForm { .. } => "fill_form",
            StepAction::AttachResume { .. } => "attach_resume",
            StepAction::Submit => "submit",
            StepAction::VerifyConfirmation => "verify_confirmation",
        }
    }
}

impl fmt::Display for StepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Page state captured when an attempt fails.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagnosticSnapshot {
    pub captured_at: DateTime<Utc>,
    pub url: Option<String>,
    pub html: Option<String>,
    #[serde(skip)]
    pub screenshot_png: Option<Vec<u8>>,
    /// Free-form context from the engine (failing step, error)
    pub note: Option<String>,
}

impl DiagnosticSnapshot {
    /// A snapshot with no page state, only an explanatory note.
    pub fn note_only(note: impl Into<String>) -> Self {
        Self {
            captured_at: Utc::now(),
            note: Some(note.into()),
            ..Default::default()
        }
    }
}

/// A leased browser-like context.
///
/// Implementations drive a real browser; the engine only sequences actions and
/// classifies their failures.
#[async_trait]
pub trait AutomationSession: Send {
    async fn perform(&mut self, action: &StepAction) -> Result<(), AutomationStepError>;

    async fn snapshot(&mut self) -> Result<DiagnosticSnapshot>;

    /// Tear down the context. Called when the session is discarded.
    async fn close(&mut self) {}
}

/// Creates fresh automation sessions for the pool.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn AutomationSession>>;
}

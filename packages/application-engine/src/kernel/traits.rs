// Trait definitions for external collaborators
//
// These are INFRASTRUCTURE traits only - the engine decides what to do with
// their results. Profiles, resumes, scoring models and artifact storage live
// outside the core.
//
// Naming convention: Base* for trait names (e.g., BaseProfileStore)

use std::collections::HashMap;
use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::common::{ApplicationId, UserId};
use crate::domains::automation::{DiagnosticSnapshot, FormField};
use crate::domains::jobs::{JobPosting, JobSource};

// =============================================================================
// Applicant profiles
// =============================================================================

/// Login for one job board.
#[derive(Clone, Serialize, Deserialize)]
pub struct SiteCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for SiteCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SiteCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// What the automation needs to know about an applicant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplicantProfile {
    pub user_id: UserId,
    pub full_name: String,
    pub email: String,
    pub phone: Option<String>,
    pub location: Option<String>,
    /// Reference into the external resume store
    pub resume_ref: Option<String>,
    #[serde(default)]
    pub site_credentials: HashMap<JobSource, SiteCredentials>,
}

impl ApplicantProfile {
    /// Contact fields typed into the application form, in form order.
    pub fn form_fields(&self) -> Vec<FormField> {
        let mut fields = vec![
            FormField::new("full_name", &self.full_name),
            FormField::new("email", &self.email),
        ];
        if let Some(phone) = &self.phone {
            fields.push(FormField::new("phone", phone));
        }
        if let Some(location) = &self.location {
            fields.push(FormField::new("location", location));
        }
        fields
    }

    pub fn credentials_for(&self, source: JobSource) -> Option<&SiteCredentials> {
        self.site_credentials.get(&source)
    }
}

#[async_trait]
pub trait BaseProfileStore: Send + Sync {
    /// `None` when the user has no profile on file.
    async fn profile(&self, user_id: UserId) -> Result<Option<ApplicantProfile>>;
}

// =============================================================================
// Scoring (optional)
// =============================================================================

#[async_trait]
pub trait BaseScoringService: Send + Sync {
    /// Fit of `profile` for `job`, 0.0 to 1.0.
    async fn score(&self, profile: &ApplicantProfile, job: &JobPosting) -> Result<f32>;
}

// =============================================================================
// Diagnostic artifacts
// =============================================================================

#[async_trait]
pub trait BaseArtifactStore: Send + Sync {
    /// Persist a failure snapshot and return a reference to it.
    async fn store(
        &self,
        application_id: ApplicationId,
        snapshot: &DiagnosticSnapshot,
    ) -> Result<String>;
}

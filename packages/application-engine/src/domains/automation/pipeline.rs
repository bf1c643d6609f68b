//! Submission pipeline: one driver loop over a list of steps.
//!
//! Transient step errors are retried with exponential backoff up to the
//! step's bound; permanent errors end the attempt at once. The whole attempt
//! is bounded by `attempt_timeout`, and cancellation is checked before every
//! step and during backoff. Every failure, cancellation included, leaves a
//! diagnostic artifact: the session's page state when it can be captured, a
//! note otherwise.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::session::{AutomationSession, DiagnosticSnapshot, StepAction};
use super::steps::{Step, StepKind};
use crate::common::ApplicationId;
use crate::domains::applications::Application;
use crate::domains::jobs::JobPosting;
use crate::domains::metering::{ServiceTag, UsageMeter, UsageUnits};
use crate::error::AutomationStepError;
use crate::kernel::{ApplicantProfile, BaseArtifactStore};

/// Everything one attempt needs to know.
#[derive(Debug, Clone, Copy)]
pub struct SubmissionRequest<'a> {
    pub application: &'a Application,
    pub job: &'a JobPosting,
    pub profile: &'a ApplicantProfile,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionFailure {
    /// Human-readable reason, stored as the application's error message
    pub message: String,
    pub diagnostic_ref: Option<String>,
    /// Step that failed; `None` for attempt-level failures
    pub step: Option<StepKind>,
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionResult {
    pub log: Vec<String>,
    /// Step executions including retries
    pub step_executions: u32,
    pub failure: Option<SubmissionFailure>,
}

impl SubmissionResult {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// An attempt that ended outside the step loop: before any step ran, or
    /// because the session itself crashed.
    pub fn aborted(message: impl Into<String>, diagnostic_ref: Option<String>) -> Self {
        let message = message.into();
        Self {
            log: vec![format!("failed: {message}")],
            step_executions: 0,
            failure: Some(SubmissionFailure {
                message,
                diagnostic_ref,
                step: None,
                cancelled: false,
            }),
        }
    }
}

struct StepFailure {
    step: Option<StepKind>,
    message: String,
    cancelled: bool,
}

impl StepFailure {
    fn at(step: StepKind, message: String) -> Self {
        Self {
            step: Some(step),
            message,
            cancelled: false,
        }
    }

    fn cancelled(step: StepKind) -> Self {
        Self {
            step: Some(step),
            message: format!("attempt cancelled before {step}"),
            cancelled: true,
        }
    }
}

pub struct SubmissionPipeline {
    steps: Vec<Step>,
    attempt_timeout: Duration,
    snapshot_timeout: Duration,
    artifacts: Arc<dyn BaseArtifactStore>,
    meter: UsageMeter,
}

impl SubmissionPipeline {
    pub fn new(
        steps: Vec<Step>,
        attempt_timeout: Duration,
        artifacts: Arc<dyn BaseArtifactStore>,
        meter: UsageMeter,
    ) -> Self {
        let snapshot_timeout = steps
            .iter()
            .map(|s| s.timeout)
            .max()
            .unwrap_or(Duration::from_secs(30));
        Self {
            steps,
            attempt_timeout,
            snapshot_timeout,
            artifacts,
            meter,
        }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Run one attempt on `session`. Never fails: every error is folded into
    /// the result.
    pub async fn execute(
        &self,
        request: SubmissionRequest<'_>,
        session: &mut dyn AutomationSession,
        cancel: &CancellationToken,
    ) -> SubmissionResult {
        let application_id = request.application.id;
        let mut log = Vec::new();
        let mut executions = 0u32;

        tracing::info!(
            application_id = %application_id,
            job_id = %request.job.id,
            "Starting submission attempt"
        );

        let driven = tokio::time::timeout(
            self.attempt_timeout,
            self.drive(request, &mut *session, cancel, &mut log, &mut executions),
        )
        .await;
        let outcome = driven.unwrap_or_else(|_| {
            Err(StepFailure {
                step: None,
                message: format!("attempt timed out after {:?}", self.attempt_timeout),
                cancelled: false,
            })
        });

        self.meter
            .record(
                Some(request.application.user_id),
                ServiceTag::FormFill,
                UsageUnits::flat(i64::from(executions)),
            )
            .await;

        let failure = match outcome {
            Ok(()) => {
                tracing::info!(
                    application_id = %application_id,
                    step_executions = executions,
                    "Submission succeeded"
                );
                None
            }
            Err(failure) => {
                tracing::warn!(
                    application_id = %application_id,
                    step = failure.step.map(|s| s.as_str()).unwrap_or("attempt"),
                    error = %failure.message,
                    "Submission failed"
                );
                log.push(format!("failed: {}", failure.message));
                let diagnostic_ref = self
                    .capture_diagnostic(application_id, session, &failure.message)
                    .await;
                Some(SubmissionFailure {
                    message: failure.message,
                    diagnostic_ref,
                    step: failure.step,
                    cancelled: failure.cancelled,
                })
            }
        };

        SubmissionResult {
            log,
            step_executions: executions,
            failure,
        }
    }

    /// Persist a snapshot; `None` (with a warning) if the store fails.
    pub async fn store_diagnostic(
        &self,
        application_id: ApplicationId,
        snapshot: &DiagnosticSnapshot,
    ) -> Option<String> {
        match self.artifacts.store(application_id, snapshot).await {
            Ok(reference) => Some(reference),
            Err(e) => {
                tracing::warn!(
                    application_id = %application_id,
                    error = %e,
                    "Failed to store diagnostic artifact"
                );
                None
            }
        }
    }

    async fn capture_diagnostic(
        &self,
        application_id: ApplicationId,
        session: &mut dyn AutomationSession,
        failure: &str,
    ) -> Option<String> {
        let snapshot =
            match tokio::time::timeout(self.snapshot_timeout, session.snapshot()).await {
                Ok(Ok(mut snapshot)) => {
                    snapshot.note = Some(failure.to_string());
                    snapshot
                }
                Ok(Err(e)) => {
                    tracing::warn!(
                        application_id = %application_id,
                        error = %e,
                        "Failed to capture diagnostic snapshot"
                    );
                    DiagnosticSnapshot::note_only(format!("{failure}; snapshot unavailable: {e:#}"))
                }
                Err(_) => {
                    tracing::warn!(
                        application_id = %application_id,
                        "Diagnostic snapshot timed out"
                    );
                    DiagnosticSnapshot::note_only(format!("{failure}; snapshot timed out"))
                }
            };
        self.store_diagnostic(application_id, &snapshot).await
    }

    async fn drive(
        &self,
        request: SubmissionRequest<'_>,
        session: &mut dyn AutomationSession,
        cancel: &CancellationToken,
        log: &mut Vec<String>,
        executions: &mut u32,
    ) -> Result<(), StepFailure> {
        for step in &self.steps {
            if cancel.is_cancelled() {
                return Err(StepFailure::cancelled(step.kind));
            }
            let action = resolve_action(step.kind, request)
                .map_err(|e| StepFailure::at(step.kind, format!("{} failed: {e}", step.kind)))?;
            self.run_step(step, &action, &mut *session, cancel, log, executions)
                .await?;
        }
        Ok(())
    }

    async fn run_step(
        &self,
        step: &Step,
        action: &StepAction,
        session: &mut dyn AutomationSession,
        cancel: &CancellationToken,
        log: &mut Vec<String>,
        executions: &mut u32,
    ) -> Result<(), StepFailure> {
        let mut retry = 0;
        loop {
            *executions += 1;
            let result = match tokio::time::timeout(step.timeout, session.perform(action)).await {
                Ok(result) => result,
                Err(_) => Err(AutomationStepError::Transient(format!(
                    "step timed out after {:?}",
                    step.timeout
                ))),
            };

            match result {
                Ok(()) => {
                    log.push(format!("{}: ok", step.kind));
                    return Ok(());
                }
                Err(e) if e.is_transient() && retry < step.retry.max_retries => {
                    retry += 1;
                    let delay = step.retry.delay_for_retry(retry);
                    log.push(format!(
                        "{}: {e}; retry {retry}/{} in {delay:?}",
                        step.kind, step.retry.max_retries
                    ));
                    tracing::debug!(step = %step.kind, retry, error = %e, "Retrying step");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(StepFailure::cancelled(step.kind)),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    log.push(format!("{}: {e}", step.kind));
                    let message = if e.is_transient() {
                        format!("{} failed after {} tries: {e}", step.kind, retry + 1)
                    } else {
                        format!("{} failed: {e}", step.kind)
                    };
                    return Err(StepFailure::at(step.kind, message));
                }
            }
        }
    }
}

/// Bind a step to this applicant and posting.
fn resolve_action(
    kind: StepKind,
    request: SubmissionRequest<'_>,
) -> Result<StepAction, AutomationStepError> {
    Ok(match kind {
        StepKind::Navigate => StepAction::Navigate {
            url: request.job.source_url.clone(),
            credentials: request.profile.credentials_for(request.job.source).cloned(),
        },
        StepKind::FillForm => StepAction::FillForm {
            fields: request.profile.form_fields(),
        },
        StepKind::AttachResume => StepAction::AttachResume {
            resume_ref: request
                .profile
                .resume_ref
                .clone()
                .ok_or_else(|| AutomationStepError::Permanent("no resume on file".into()))?,
        },
        StepKind::Submit => StepAction::Submit,
        StepKind::VerifyConfirmation => StepAction::VerifyConfirmation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::UserId;
    use crate::domains::automation::steps::{default_steps, RetryPolicy};
    use crate::domains::jobs::{JobSource, NewPosting};
    use crate::kernel::test_dependencies::{MemoryArtifactStore, MockSession};
    use crate::kernel::MemoryStore;
    use chrono::Utc;

    struct Fixture {
        application: Application,
        job: JobPosting,
        profile: ApplicantProfile,
        artifacts: Arc<MemoryArtifactStore>,
        store: Arc<MemoryStore>,
    }

    impl Fixture {
        fn new() -> Self {
            let posting = NewPosting::builder()
                .source(JobSource::Linkedin)
                .external_id("li-1")
                .title("Platform Engineer")
                .company("Acme")
                .source_url("https://linkedin.example/jobs/li-1")
                .build();
            let job = JobPosting::first_seen(&posting, Utc::now());
            let user = UserId::new();
            Self {
                application: Application::pending(user, job.id),
                job,
                profile: ApplicantProfile {
                    user_id: user,
                    full_name: "Ada Lovelace".into(),
                    email: "ada@example.com".into(),
                    resume_ref: Some("resume-1".into()),
                    ..Default::default()
                },
                artifacts: Arc::new(MemoryArtifactStore::new()),
                store: Arc::new(MemoryStore::new()),
            }
        }

        fn pipeline(&self, retries: u32) -> SubmissionPipeline {
            SubmissionPipeline::new(
                default_steps(
                    Duration::from_millis(200),
                    RetryPolicy::new(retries, Duration::from_millis(1)),
                ),
                Duration::from_secs(5),
                self.artifacts.clone(),
                UsageMeter::new(self.store.clone()),
            )
        }

        fn request(&self) -> SubmissionRequest<'_> {
            SubmissionRequest {
                application: &self.application,
                job: &self.job,
                profile: &self.profile,
            }
        }
    }

    #[tokio::test]
    async fn all_steps_succeed() {
        let fx = Fixture::new();
        let mut session = MockSession::new();
        let result = fx
            .pipeline(2)
            .execute(fx.request(), &mut session, &CancellationToken::new())
            .await;

        assert!(result.is_success());
        assert_eq!(result.step_executions, 5);
        assert_eq!(session.performed().len(), 5);
        assert_eq!(result.log[0], "navigate: ok");
        assert_eq!(fx.store.usage_count(), 1);
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let fx = Fixture::new();
        let mut session = MockSession::new()
            .fail_step("fill_form", AutomationStepError::element_not_rendered("#email"))
            .fail_step("fill_form", AutomationStepError::element_not_rendered("#email"));
        let result = fx
            .pipeline(2)
            .execute(fx.request(), &mut session, &CancellationToken::new())
            .await;

        assert!(result.is_success(), "{result:?}");
        assert_eq!(result.step_executions, 7);
    }

    #[tokio::test]
    async fn transient_submit_error_is_not_retried() {
        let fx = Fixture::new();
        let mut session = MockSession::new()
            .fail_step("submit", AutomationStepError::element_not_rendered("#submit"));
        let result = fx
            .pipeline(2)
            .execute(fx.request(), &mut session, &CancellationToken::new())
            .await;

        let failure = result.failure.unwrap();
        assert_eq!(failure.step, Some(StepKind::Submit));
        assert!(failure.message.contains("after 1 tries"), "{}", failure.message);
        assert_eq!(
            session.performed(),
            vec!["navigate", "fill_form", "attach_resume", "submit"]
        );
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let fx = Fixture::new();
        let mut session = MockSession::new();
        for _ in 0..3 {
            session = session.fail_step("navigate", AutomationStepError::navigation_timeout("x"));
        }
        let result = fx
            .pipeline(1)
            .execute(fx.request(), &mut session, &CancellationToken::new())
            .await;

        let failure = result.failure.unwrap();
        assert_eq!(failure.step, Some(StepKind::Navigate));
        assert!(failure.message.contains("after 2 tries"), "{}", failure.message);
        assert_eq!(result.step_executions, 2);
    }

    #[tokio::test]
    async fn permanent_submit_failure_captures_diagnostics() {
        let fx = Fixture::new();
        let mut session = MockSession::new()
            .fail_step("submit", AutomationStepError::form_unrecognized("no submit button"));
        let result = fx
            .pipeline(2)
            .execute(fx.request(), &mut session, &CancellationToken::new())
            .await;

        let failure = result.failure.unwrap();
        assert_eq!(failure.step, Some(StepKind::Submit));
        assert_eq!(result.step_executions, 4);
        let reference = failure.diagnostic_ref.unwrap();
        let stored = fx.artifacts.get(&reference).unwrap();
        assert!(stored.note.unwrap().contains("form structure unrecognized"));
    }

    #[tokio::test]
    async fn snapshot_failure_still_reports_error() {
        let fx = Fixture::new();
        let mut session = MockSession::new()
            .fail_step("submit", AutomationStepError::bot_challenge("captcha"))
            .failing_snapshots();
        let result = fx
            .pipeline(2)
            .execute(fx.request(), &mut session, &CancellationToken::new())
            .await;

        let failure = result.failure.unwrap();
        assert!(failure.message.contains("bot challenge"));
        let stored = fx.artifacts.get(&failure.diagnostic_ref.unwrap()).unwrap();
        assert!(stored.html.is_none());
        let note = stored.note.unwrap();
        assert!(note.contains("bot challenge"), "{note}");
        assert!(note.contains("snapshot unavailable"), "{note}");
    }

    #[tokio::test]
    async fn missing_resume_fails_without_performing_the_step() {
        let mut fx = Fixture::new();
        fx.profile.resume_ref = None;
        let mut session = MockSession::new();
        let result = fx
            .pipeline(2)
            .execute(fx.request(), &mut session, &CancellationToken::new())
            .await;

        let failure = result.failure.unwrap();
        assert_eq!(failure.step, Some(StepKind::AttachResume));
        assert_eq!(session.performed(), vec!["navigate", "fill_form"]);
    }

    #[tokio::test]
    async fn cancelled_before_start_runs_nothing() {
        let fx = Fixture::new();
        let mut session = MockSession::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = fx.pipeline(2).execute(fx.request(), &mut session, &cancel).await;

        let failure = result.failure.unwrap();
        assert!(failure.cancelled);
        assert!(session.performed().is_empty());
        let stored = fx.artifacts.get(&failure.diagnostic_ref.unwrap()).unwrap();
        assert!(stored.note.unwrap().contains("cancelled before navigate"));
    }

    #[tokio::test]
    async fn attempt_timeout_bounds_the_whole_attempt() {
        let fx = Fixture::new();
        let mut session = MockSession::new().with_delay(Duration::from_millis(100));
        let pipeline = SubmissionPipeline::new(
            default_steps(Duration::from_secs(1), RetryPolicy::none()),
            Duration::from_millis(150),
            fx.artifacts.clone(),
            UsageMeter::new(fx.store.clone()),
        );
        let result = pipeline
            .execute(fx.request(), &mut session, &CancellationToken::new())
            .await;

        let failure = result.failure.unwrap();
        assert!(failure.step.is_none());
        assert!(failure.message.contains("attempt timed out"));
    }
}

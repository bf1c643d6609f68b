use std::sync::Arc;

use tokio::sync::mpsc;

use super::models::{
    Application, ApplicationFilter, ApplicationStats, ApplicationStatusView, ApplyOutcome,
    DeleteOutcome, FeedbackSignal, InsertOutcome, StatusChange,
};
use super::state_machine::{decide_apply, ensure_transition, ApplyDecision, DELETABLE};
use crate::common::{ApplicationId, JobId, UserId};
use crate::domains::jobs::{JobPosting, JobRegistry};
use crate::domains::metering::{ServiceTag, UsageMeter, UsageUnits};
use crate::error::{EngineError, Result};
use crate::kernel::{ApplicationStore, BaseProfileStore, BaseScoringService};

/// Attempts to resolve a racing writer before giving up with `Conflict`.
const APPLY_CAS_ATTEMPTS: usize = 3;

/// Producer side of the apply queue. Rows are persisted before they are
/// enqueued, so a lost message only delays the attempt until the next
/// startup recovery.
#[derive(Clone)]
pub struct ApplyQueue {
    tx: mpsc::UnboundedSender<ApplicationId>,
}

pub type ApplyQueueReceiver = mpsc::UnboundedReceiver<ApplicationId>;

impl ApplyQueue {
    pub fn new() -> (Self, ApplyQueueReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn enqueue(&self, id: ApplicationId) {
        if self.tx.send(id).is_err() {
            tracing::warn!(
                application_id = %id,
                "Apply queue closed; application stays pending until recovery"
            );
        }
    }
}

/// User-facing application operations. Every status write goes through a
/// conditional store update; this type never writes a status blindly.
#[derive(Clone)]
pub struct ApplicationService {
    store: Arc<dyn ApplicationStore>,
    jobs: JobRegistry,
    queue: ApplyQueue,
    profiles: Arc<dyn BaseProfileStore>,
    scoring: Option<Arc<dyn BaseScoringService>>,
    meter: UsageMeter,
}

impl ApplicationService {
    pub fn new(
        store: Arc<dyn ApplicationStore>,
        jobs: JobRegistry,
        queue: ApplyQueue,
        profiles: Arc<dyn BaseProfileStore>,
        scoring: Option<Arc<dyn BaseScoringService>>,
        meter: UsageMeter,
    ) -> Self {
        Self {
            store,
            jobs,
            queue,
            profiles,
            scoring,
            meter,
        }
    }

    /// Request an attempt for (user, job).
    ///
    /// Creates a `PENDING` row, or re-queues a `FAILED` one; any other status
    /// is returned unchanged as `AlreadyActive`.
    pub async fn apply(&self, user_id: UserId, job_id: JobId) -> Result<ApplyOutcome> {
        let job = self
            .jobs
            .get(job_id)
            .await?
            .filter(|job| job.is_active)
            .ok_or_else(|| EngineError::not_found("job", job_id))?;

        let mut last_seen: Option<Application> = None;
        for _ in 0..APPLY_CAS_ATTEMPTS {
            let existing = self.store.find_application(user_id, job_id).await?;
            let decision = decide_apply(existing.as_ref().map(|app| app.status));

            match (decision, existing) {
                (ApplyDecision::Create, _) | (_, None) => {
                    let app = Application::pending(user_id, job_id);
                    match self.store.insert_application(&app).await? {
                        InsertOutcome::Inserted(app) => {
                            self.queue.enqueue(app.id);
                            tracing::info!(
                                application_id = %app.id,
                                user_id = %user_id,
                                job_id = %job_id,
                                "Application created"
                            );
                            self.score(&app, &job).await;
                            return Ok(ApplyOutcome::Created {
                                application_id: app.id,
                                status: app.status,
                            });
                        }
                        // Lost the insert race; decide again on the winner's row
                        InsertOutcome::Existing(app) => last_seen = Some(app),
                    }
                }
                (ApplyDecision::Requeue, Some(app)) => {
                    match self
                        .store
                        .transition_application(app.id, app.status, &StatusChange::requeue())
                        .await?
                    {
                        Some(app) => {
                            self.queue.enqueue(app.id);
                            tracing::info!(
                                application_id = %app.id,
                                attempt_count = app.attempt_count,
                                "Failed application re-queued"
                            );
                            return Ok(ApplyOutcome::Requeued {
                                application_id: app.id,
                                status: app.status,
                            });
                        }
                        None => last_seen = Some(app),
                    }
                }
                (ApplyDecision::NoOp, Some(app)) => {
                    tracing::debug!(
                        application_id = %app.id,
                        status = %app.status,
                        "Apply is a no-op"
                    );
                    return Ok(ApplyOutcome::AlreadyActive {
                        application_id: app.id,
                        status: app.status,
                    });
                }
            }
        }

        match last_seen {
            Some(app) => Err(EngineError::Conflict {
                id: app.id.to_string(),
                status: app.status,
            }),
            None => Err(anyhow::anyhow!(
                "apply for user {user_id} and job {job_id} did not converge"
            )
            .into()),
        }
    }

    /// `apply` for the (user, job) pair of an existing row.
    pub async fn retry(&self, id: ApplicationId) -> Result<ApplyOutcome> {
        let app = self.get(id).await?;
        self.apply(app.user_id, app.job_id).await
    }

    /// Delete a `PENDING` or `FAILED` application.
    pub async fn delete(&self, id: ApplicationId) -> Result<()> {
        match self.store.delete_application_if(id, &DELETABLE).await? {
            DeleteOutcome::Deleted => {
                tracing::info!(application_id = %id, "Application deleted");
                Ok(())
            }
            DeleteOutcome::NotFound => Err(EngineError::not_found("application", id)),
            DeleteOutcome::Rejected(status) => Err(EngineError::DeletionRejected {
                id: id.to_string(),
                status,
            }),
        }
    }

    pub async fn get(&self, id: ApplicationId) -> Result<Application> {
        self.store
            .get_application(id)
            .await?
            .ok_or_else(|| EngineError::not_found("application", id))
    }

    pub async fn status(&self, id: ApplicationId) -> Result<ApplicationStatusView> {
        Ok(ApplicationStatusView::from(&self.get(id).await?))
    }

    /// Record a downstream outcome (interview, rejection, offer).
    pub async fn record_feedback(
        &self,
        id: ApplicationId,
        signal: FeedbackSignal,
    ) -> Result<Application> {
        let app = self.get(id).await?;
        ensure_transition(app.status, signal.into())?;

        match self
            .store
            .transition_application(id, app.status, &StatusChange::feedback(signal))
            .await?
        {
            Some(updated) => {
                tracing::info!(
                    application_id = %id,
                    from = %app.status,
                    to = %updated.status,
                    "Feedback recorded"
                );
                Ok(updated)
            }
            None => {
                let current = self.get(id).await?;
                Err(EngineError::Conflict {
                    id: id.to_string(),
                    status: current.status,
                })
            }
        }
    }

    pub async fn list(&self, filter: &ApplicationFilter) -> Result<Vec<Application>> {
        Ok(self.store.list_applications(filter).await?)
    }

    pub async fn stats(&self, user_id: UserId) -> Result<ApplicationStats> {
        Ok(self.store.application_stats(user_id).await?)
    }

    /// Best-effort fit score from the optional scoring collaborator.
    async fn score(&self, app: &Application, job: &JobPosting) {
        let Some(scoring) = &self.scoring else {
            return;
        };
        let profile = match self.profiles.profile(app.user_id).await {
            Ok(Some(profile)) => profile,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(application_id = %app.id, error = %e, "Failed to load profile for scoring");
                return;
            }
        };

        let scored = scoring.score(&profile, job).await;
        self.meter
            .record(Some(app.user_id), ServiceTag::Matching, UsageUnits::flat(1))
            .await;

        match scored {
            Ok(score) => {
                if let Err(e) = self.store.set_fit_score(app.id, score).await {
                    tracing::warn!(application_id = %app.id, error = %e, "Failed to store fit score");
                }
            }
            Err(e) => {
                tracing::warn!(application_id = %app.id, error = %e, "Scoring failed; continuing without a score");
            }
        }
    }
}

//! Apply worker: consumes the apply queue and runs submission attempts.
//!
//! ```text
//! ApplyWorker
//!     │
//!     ├─► Receive application id (mpsc queue)
//!     ├─► Claim: PENDING → IN_PROGRESS (compare-and-set; losers skip)
//!     ├─► Load job + applicant profile
//!     ├─► Lease a session from the pool (bounded wait)
//!     ├─► SubmissionPipeline.execute
//!     └─► Record: IN_PROGRESS → APPLIED | FAILED
//! ```
//!
//! At most `concurrency` attempts run at once. On shutdown the worker stops
//! receiving, cancels running attempts (they stop at the next step boundary)
//! and waits for them to record their outcome. An attempt whose session
//! panics is recorded `FAILED` like any other broken attempt.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::models::{Application, ApplicationStatus, StatusChange};
use super::service::{ApplyQueue, ApplyQueueReceiver};
use crate::common::ApplicationId;
use crate::domains::automation::{
    DiagnosticSnapshot, SessionPool, SubmissionPipeline, SubmissionRequest, SubmissionResult,
};
use crate::domains::jobs::JobRegistry;
use crate::error::panic_message;
use crate::kernel::{ApplicationStore, BaseProfileStore};

/// Configuration for the apply worker.
#[derive(Debug, Clone)]
pub struct ApplyWorkerConfig {
    /// Maximum number of attempts running at once
    pub concurrency: usize,
    /// How long an attempt waits for a free automation session
    pub acquire_timeout: Duration,
    /// How long shutdown waits for cancelled attempts to record an outcome
    pub drain_timeout: Duration,
}

impl Default for ApplyWorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            acquire_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// What startup recovery did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// `IN_PROGRESS` rows moved to `FAILED`
    pub interrupted: usize,
    /// `PENDING` rows put back on the queue
    pub requeued: usize,
}

pub struct ApplyWorker {
    store: Arc<dyn ApplicationStore>,
    jobs: JobRegistry,
    profiles: Arc<dyn BaseProfileStore>,
    pool: Arc<SessionPool>,
    pipeline: Arc<SubmissionPipeline>,
    queue: ApplyQueue,
    config: ApplyWorkerConfig,
}

impl ApplyWorker {
    pub fn new(
        store: Arc<dyn ApplicationStore>,
        jobs: JobRegistry,
        profiles: Arc<dyn BaseProfileStore>,
        pool: Arc<SessionPool>,
        pipeline: Arc<SubmissionPipeline>,
        queue: ApplyQueue,
        config: ApplyWorkerConfig,
    ) -> Self {
        Self {
            store,
            jobs,
            profiles,
            pool,
            pipeline,
            queue,
            config,
        }
    }

    /// Repair rows left behind by a previous process.
    ///
    /// Nothing can be running yet, so an `IN_PROGRESS` row is an attempt that
    /// died mid-flight; it becomes `FAILED` and may be retried. `PENDING` rows
    /// lost their queue message and are enqueued again.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for app in self
            .store
            .applications_with_status(ApplicationStatus::InProgress)
            .await?
        {
            let message = "attempt interrupted before completion";
            let diagnostic_ref = self
                .pipeline
                .store_diagnostic(app.id, &DiagnosticSnapshot::note_only(message))
                .await;
            let change =
                StatusChange::failed(message, diagnostic_ref, app.automation_log.clone());
            if self
                .store
                .transition_application(app.id, ApplicationStatus::InProgress, &change)
                .await?
                .is_some()
            {
                report.interrupted += 1;
            }
        }

        for app in self
            .store
            .applications_with_status(ApplicationStatus::Pending)
            .await?
        {
            self.queue.enqueue(app.id);
            report.requeued += 1;
        }

        if report.interrupted > 0 || report.requeued > 0 {
            info!(
                interrupted = report.interrupted,
                requeued = report.requeued,
                "Recovered applications from previous run"
            );
        }
        Ok(report)
    }

    /// Consume the queue until `shutdown` fires or every sender is dropped.
    pub async fn run(self: Arc<Self>, mut rx: ApplyQueueReceiver, shutdown: CancellationToken) {
        info!(concurrency = self.config.concurrency, "apply worker starting");

        let permits = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = JoinSet::new();

        loop {
            let id = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = rx.recv() => match next {
                    Some(id) => id,
                    None => break,
                },
            };

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let worker = self.clone();
            let cancel = shutdown.child_token();
            tasks.spawn(async move {
                worker.process(id, cancel).await;
                drop(permit);
            });

            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "apply attempt task panicked");
                }
            }
        }

        // Attempt tokens are children of `shutdown`, so they are already
        // cancelled; wait for them to record their outcome.
        if !tasks.is_empty() {
            info!(count = tasks.len(), "waiting for running attempts to complete");
        }
        let drained = tokio::time::timeout(self.config.drain_timeout, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "apply attempt task panicked");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("apply attempts still running after drain timeout; aborting");
            tasks.abort_all();
        }

        info!("apply worker stopped");
    }

    /// Claim, attempt and record one application.
    async fn process(&self, id: ApplicationId, cancel: CancellationToken) {
        let claimed = match self
            .store
            .transition_application(id, ApplicationStatus::Pending, &StatusChange::begin_attempt())
            .await
        {
            Ok(Some(app)) => app,
            Ok(None) => {
                debug!(application_id = %id, "application no longer pending; skipping");
                return;
            }
            Err(e) => {
                error!(application_id = %id, error = %e, "failed to claim application");
                return;
            }
        };

        let result = match AssertUnwindSafe(self.attempt(&claimed, &cancel))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(payload) => {
                let message = format!(
                    "automation session panicked: {}",
                    panic_message(payload.as_ref())
                );
                error!(application_id = %id, error = %message, "apply attempt panicked");
                self.abort(id, message).await
            }
        };
        let change = match result.failure {
            None => StatusChange::succeeded(result.log),
            Some(failure) => {
                StatusChange::failed(failure.message, failure.diagnostic_ref, result.log)
            }
        };

        match self
            .store
            .transition_application(id, ApplicationStatus::InProgress, &change)
            .await
        {
            Ok(Some(app)) => info!(
                application_id = %id,
                status = %app.status,
                attempt_count = app.attempt_count,
                "attempt finished"
            ),
            Ok(None) => warn!(application_id = %id, "application changed during attempt; outcome dropped"),
            Err(e) => error!(application_id = %id, error = %e, "failed to record attempt outcome"),
        }
    }

    /// End an attempt that never reached the step loop, leaving a note-only
    /// diagnostic behind.
    async fn abort(&self, id: ApplicationId, message: String) -> SubmissionResult {
        let diagnostic_ref = self
            .pipeline
            .store_diagnostic(id, &DiagnosticSnapshot::note_only(message.clone()))
            .await;
        SubmissionResult::aborted(message, diagnostic_ref)
    }

    async fn attempt(&self, app: &Application, cancel: &CancellationToken) -> SubmissionResult {
        let job = match self.jobs.get(app.job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => return self.abort(app.id, "job posting no longer exists".into()).await,
            Err(e) => return self.abort(app.id, format!("failed to load job: {e:#}")).await,
        };

        let profile = match self.profiles.profile(app.user_id).await {
            Ok(Some(profile)) => profile,
            Ok(None) => return self.abort(app.id, "applicant profile not found".into()).await,
            Err(e) => {
                return self
                    .abort(app.id, format!("failed to load applicant profile: {e:#}"))
                    .await
            }
        };

        // Pool exhaustion and session creation failures alike
        let mut lease = match self.pool.acquire(self.config.acquire_timeout).await {
            Ok(lease) => lease,
            Err(e) => return self.abort(app.id, e.to_string()).await,
        };

        let request = SubmissionRequest {
            application: app,
            job: &job,
            profile: &profile,
        };
        let result = self.pipeline.execute(request, lease.session(), cancel).await;

        if !result.is_success() {
            lease.mark_broken();
        }
        lease.release().await;
        result
    }
}

//! The orchestration engine: one handle over crawling, applications and
//! metering.
//!
//! ```text
//! Engine
//!     │
//!     ├─► CrawlScheduler ──► SourceAdapter ──► JobRegistry
//!     ├─► ApplicationService ──► apply queue ──► ApplyWorker
//!     │                                             ├─► SessionPool
//!     │                                             └─► SubmissionPipeline ──► BaseArtifactStore
//!     └─► UsageMeter (fed by the scheduler, the pipeline and scoring)
//! ```
//!
//! Construction wires the components; `start` repairs state left by a
//! previous process and spawns the apply worker; `shutdown` stops both queues
//! and waits for in-flight work up to the configured grace period.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;

use crate::common::{ApplicationId, CrawlRequestId, JobId, UserId};
use crate::config::{Config, EngineConfig};
use crate::domains::applications::{
    Application, ApplicationFilter, ApplicationService, ApplicationStats, ApplicationStatusView,
    ApplyOutcome, ApplyQueue, ApplyQueueReceiver, ApplyWorker, FeedbackSignal, RecoveryReport,
};
use crate::domains::automation::{PoolStatus, SessionFactory, SessionPool, SubmissionPipeline};
use crate::domains::crawling::{
    AdapterRegistry, CancelOutcome, CrawlRequest, CrawlScheduler, JsonFeedAdapter,
};
use crate::domains::jobs::{JobPosting, JobRegistry, JobSearch, JobSource};
use crate::domains::metering::{UsageMeter, UsageStats};
use crate::error::{EngineError, Result};
use crate::kernel::{
    BaseArtifactStore, BaseProfileStore, BaseScoringService, FileArtifactStore, PostgresStore,
    Store, UsageStore,
};

/// Timeout for one request to the JSON job feed.
const FEED_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Collaborators the engine consumes but does not own.
#[derive(TypedBuilder)]
pub struct EngineDeps {
    pub profiles: Arc<dyn BaseProfileStore>,
    pub sessions: Arc<dyn SessionFactory>,
    pub artifacts: Arc<dyn BaseArtifactStore>,
    #[builder(default)]
    pub adapters: AdapterRegistry,
    #[builder(default, setter(strip_option))]
    pub scoring: Option<Arc<dyn BaseScoringService>>,
    /// Usage records go to the main store unless this is set
    #[builder(default, setter(strip_option))]
    pub usage_store: Option<Arc<dyn UsageStore>>,
    #[builder(default)]
    pub config: EngineConfig,
}

/// What `start` repaired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartupReport {
    pub orphaned_crawls: u64,
    pub applications: RecoveryReport,
}

pub struct Engine {
    jobs: JobRegistry,
    crawls: CrawlScheduler,
    applications: ApplicationService,
    worker: Arc<ApplyWorker>,
    pool: Arc<SessionPool>,
    meter: UsageMeter,
    config: EngineConfig,
    shutdown: CancellationToken,
    queue_rx: Mutex<Option<ApplyQueueReceiver>>,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn new<S: Store + 'static>(store: Arc<S>, deps: EngineDeps) -> Self {
        let EngineDeps {
            profiles,
            sessions,
            artifacts,
            adapters,
            scoring,
            usage_store,
            config,
        } = deps;

        let usage_store: Arc<dyn UsageStore> = match usage_store {
            Some(usage_store) => usage_store,
            None => store.clone(),
        };
        let meter = UsageMeter::new(usage_store);
        let jobs = JobRegistry::new(store.clone());

        let crawls = CrawlScheduler::new(
            store.clone(),
            jobs.clone(),
            adapters,
            meter.clone(),
            config.crawl_settings(),
        );

        let (queue, queue_rx) = ApplyQueue::new();
        let applications = ApplicationService::new(
            store.clone(),
            jobs.clone(),
            queue.clone(),
            profiles.clone(),
            scoring,
            meter.clone(),
        );

        let pool = Arc::new(SessionPool::new(sessions, config.session_pool_size));
        let pipeline = Arc::new(SubmissionPipeline::new(
            config.steps(),
            config.attempt_timeout,
            artifacts,
            meter.clone(),
        ));
        let worker = Arc::new(ApplyWorker::new(
            store,
            jobs.clone(),
            profiles,
            pool.clone(),
            pipeline,
            queue,
            config.worker_config(),
        ));

        Self {
            jobs,
            crawls,
            applications,
            worker,
            pool,
            meter,
            config,
            shutdown: CancellationToken::new(),
            queue_rx: Mutex::new(Some(queue_rx)),
            worker_handle: Mutex::new(None),
        }
    }

    /// Connect to Postgres (running migrations) and build an engine from
    /// process configuration. Diagnostics go to `config.engine.artifact_dir`;
    /// `JOB_FEED_URL`, when set, is served as the `custom` source.
    pub async fn connect(
        config: Config,
        profiles: Arc<dyn BaseProfileStore>,
        sessions: Arc<dyn SessionFactory>,
    ) -> anyhow::Result<Self> {
        tracing::info!("Connecting to database...");
        let store = PostgresStore::connect(&config.database_url, config.database_max_connections)
            .await?;
        tracing::info!("Database connected");

        let mut adapters = AdapterRegistry::new();
        if let Some(url) = &config.job_feed_url {
            let adapter = JsonFeedAdapter::new(url.clone(), JobSource::Custom, FEED_REQUEST_TIMEOUT)
                .context("Failed to configure job feed adapter")?;
            adapters.register(Arc::new(adapter));
        }

        let deps = EngineDeps::builder()
            .profiles(profiles)
            .sessions(sessions)
            .artifacts(Arc::new(FileArtifactStore::new(&config.engine.artifact_dir)))
            .adapters(adapters)
            .config(config.engine)
            .build();
        Ok(Self::new(Arc::new(store), deps))
    }

    /// Repair state left by a previous process and spawn the apply worker.
    pub async fn start(&self) -> anyhow::Result<StartupReport> {
        let receiver = self
            .queue_rx
            .lock()
            .ok()
            .and_then(|mut rx| rx.take())
            .context("engine already started")?;

        let orphaned_crawls = self.crawls.recover().await?;
        let applications = self.worker.recover().await?;

        let worker = self.worker.clone();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(worker.run(receiver, shutdown));
        if let Ok(mut slot) = self.worker_handle.lock() {
            *slot = Some(handle);
        }

        tracing::info!(
            sources = ?self.crawls.supported_sources(),
            pool_size = self.config.session_pool_size,
            "Application engine started"
        );
        Ok(StartupReport {
            orphaned_crawls,
            applications,
        })
    }

    /// Stop both queues. Running crawls stop at the next page and running
    /// attempts at the next step.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down application engine");
        self.shutdown.cancel();
        self.crawls.shutdown(self.config.shutdown_grace).await;

        let handle = self.worker_handle.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "apply worker task failed");
            }
        }

        self.pool.shutdown().await;
        tracing::info!("Application engine stopped");
    }

    // =========================================================================
    // Crawling
    // =========================================================================

    pub async fn submit_crawl(
        &self,
        user_id: Option<UserId>,
        query: &str,
        location: Option<&str>,
        source: JobSource,
    ) -> Result<CrawlRequestId> {
        self.crawls.submit(user_id, query, location, source).await
    }

    pub async fn cancel_crawl(&self, id: CrawlRequestId) -> Result<CancelOutcome> {
        self.crawls.cancel(id).await
    }

    pub async fn get_crawl(&self, id: CrawlRequestId) -> Result<CrawlRequest> {
        self.crawls.get(id).await
    }

    pub async fn list_recent_crawls(&self, limit: i64) -> Result<Vec<CrawlRequest>> {
        self.crawls.list_recent(limit).await
    }

    pub fn supported_sources(&self) -> Vec<JobSource> {
        self.crawls.supported_sources()
    }

    // =========================================================================
    // Jobs
    // =========================================================================

    pub async fn get_job(&self, id: JobId) -> Result<JobPosting> {
        self.jobs
            .get(id)
            .await?
            .ok_or_else(|| EngineError::not_found("job", id))
    }

    pub async fn search_jobs(&self, search: &JobSearch) -> Result<Vec<JobPosting>> {
        Ok(self.jobs.search(search).await?)
    }

    // =========================================================================
    // Applications
    // =========================================================================

    pub async fn apply(&self, user_id: UserId, job_id: JobId) -> Result<ApplyOutcome> {
        self.applications.apply(user_id, job_id).await
    }

    pub async fn retry_apply(&self, id: ApplicationId) -> Result<ApplyOutcome> {
        self.applications.retry(id).await
    }

    pub async fn delete_application(&self, id: ApplicationId) -> Result<()> {
        self.applications.delete(id).await
    }

    pub async fn get_application(&self, id: ApplicationId) -> Result<Application> {
        self.applications.get(id).await
    }

    pub async fn get_application_status(&self, id: ApplicationId) -> Result<ApplicationStatusView> {
        self.applications.status(id).await
    }

    pub async fn record_feedback(
        &self,
        id: ApplicationId,
        signal: FeedbackSignal,
    ) -> Result<Application> {
        self.applications.record_feedback(id, signal).await
    }

    pub async fn list_applications(&self, filter: &ApplicationFilter) -> Result<Vec<Application>> {
        self.applications.list(filter).await
    }

    pub async fn application_stats(&self, user_id: UserId) -> Result<ApplicationStats> {
        self.applications.stats(user_id).await
    }

    // =========================================================================
    // Metering and diagnostics
    // =========================================================================

    pub async fn get_usage_stats(&self, user_id: UserId) -> Result<UsageStats> {
        Ok(self.meter.stats(user_id).await?)
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    /// The shared session pool, for embedding code that drives sessions
    /// outside the apply worker.
    pub fn session_pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }
}

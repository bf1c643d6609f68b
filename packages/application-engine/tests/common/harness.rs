//! Test harness running a full engine against the in-memory store.
//!
//! Each test gets a fresh store, engine and mock collaborators. Timeouts are
//! shortened so failure paths finish in milliseconds.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use application_engine::common::{ApplicationId, CrawlRequestId, JobId};
use application_engine::domains::applications::Application;
use application_engine::domains::crawling::{AdapterRegistry, CrawlRequest};
use application_engine::kernel::test_dependencies::{
    MemoryArtifactStore, MockProfileStore, MockScoringService, MockSessionFactory,
    MockSourceAdapter,
};
use application_engine::kernel::{BaseScoringService, MemoryStore, UsageStore};
use application_engine::{Engine, EngineConfig, EngineDeps};
use test_context::AsyncTestContext;

use super::create_test_job;

/// How long the polling helpers wait before failing the test
const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    // Run tests with: RUST_LOG=debug cargo test -- --nocapture
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Engine settings tuned for tests.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        session_pool_size: 2,
        session_acquire_timeout: Duration::from_millis(200),
        step_timeout: Duration::from_secs(1),
        attempt_timeout: Duration::from_secs(5),
        step_retries: 2,
        step_backoff_base: Duration::from_millis(1),
        apply_concurrency: 4,
        crawl_concurrency_per_source: 2,
        crawl_min_page_delay: Duration::ZERO,
        crawl_max_pages: 5,
        shutdown_grace: Duration::from_secs(2),
        ..Default::default()
    }
}

pub struct HarnessOptions {
    pub sessions: MockSessionFactory,
    pub adapters: Vec<MockSourceAdapter>,
    pub profiles: MockProfileStore,
    pub scoring: Option<MockScoringService>,
    pub usage_store: Option<Arc<dyn UsageStore>>,
    pub config: EngineConfig,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            sessions: MockSessionFactory::new(),
            adapters: Vec::new(),
            profiles: MockProfileStore::permissive(),
            scoring: None,
            usage_store: None,
            config: test_config(),
        }
    }
}

pub struct TestHarness {
    pub engine: Engine,
    pub store: Arc<MemoryStore>,
    pub sessions: Arc<MockSessionFactory>,
    pub artifacts: Arc<MemoryArtifactStore>,
}

impl AsyncTestContext for TestHarness {
    async fn setup() -> Self {
        Self::new().await
    }

    async fn teardown(self) {
        self.engine.shutdown().await;
    }
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_options(HarnessOptions::default()).await
    }

    /// Build and start an engine over a fresh `MemoryStore`.
    pub async fn with_options(options: HarnessOptions) -> Self {
        Self::on_store(Arc::new(MemoryStore::new()), options).await
    }

    /// Build and start an engine over an existing store, as a restarted
    /// process would.
    pub async fn on_store(store: Arc<MemoryStore>, options: HarnessOptions) -> Self {
        init_tracing();

        let sessions = Arc::new(options.sessions);
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let adapters = options
            .adapters
            .into_iter()
            .fold(AdapterRegistry::new(), |registry, adapter| {
                registry.with(Arc::new(adapter))
            });

        let deps = EngineDeps {
            profiles: Arc::new(options.profiles),
            sessions: sessions.clone(),
            artifacts: artifacts.clone(),
            adapters,
            scoring: options
                .scoring
                .map(|scoring| Arc::new(scoring) as Arc<dyn BaseScoringService>),
            usage_store: options.usage_store,
            config: options.config,
        };

        let engine = Engine::new(store.clone(), deps);
        engine.start().await.expect("Failed to start engine");

        Self {
            engine,
            store,
            sessions,
            artifacts,
        }
    }

    pub async fn seed_job(&self, external_id: &str) -> JobId {
        create_test_job(self.store.as_ref(), external_id)
            .await
            .expect("Failed to seed job")
    }

    /// Poll until the application satisfies `done`.
    pub async fn wait_for_application(
        &self,
        id: ApplicationId,
        done: impl Fn(&Application) -> bool,
    ) -> Application {
        let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
        loop {
            let app = self
                .engine
                .get_application(id)
                .await
                .expect("Failed to load application");
            if done(&app) {
                return app;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("application {id} did not settle: {app:?}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until the crawl request reaches a terminal status.
    pub async fn wait_for_crawl(&self, id: CrawlRequestId) -> CrawlRequest {
        let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
        loop {
            let request = self
                .engine
                .get_crawl(id)
                .await
                .expect("Failed to load crawl request");
            if request.status.is_terminal() {
                return request;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("crawl {id} did not finish: {request:?}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Poll `check` every 10ms until it returns true or the settle timeout ends.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

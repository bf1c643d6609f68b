//! Crawl scheduler.
//!
//! ```text
//! submit ─► insert `queued` row ─► spawn task
//!                                     │
//!                                     ├─► wait for a per-source slot
//!                                     ├─► `queued → running` (conditional)
//!                                     ├─► per page: pace ─► fetch ─► upsert ─► persist progress
//!                                     └─► `running → completed | failed | cancelled`
//! ```
//!
//! Cancellation is cooperative: a queued request is cancelled with a
//! conditional write, a running one stops at the next page boundary. A panic
//! inside the page loop fails the request instead of leaving it `running`.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::adapter::{AdapterRegistry, SourceAdapter};
use super::limiter::{SourceLimiter, SourceLimiters};
use super::models::{CancelOutcome, CrawlProgress, CrawlRequest, CrawlStatus, PageToken};
use crate::common::{CrawlRequestId, UserId};
use crate::domains::jobs::{JobRegistry, JobSource};
use crate::domains::metering::{ServiceTag, UsageMeter, UsageUnits};
use crate::error::{panic_message, EngineError, Result};
use crate::kernel::CrawlStore;

const SHUTDOWN_MESSAGE: &str = "crawl scheduler shut down";

/// Limits applied to every crawl.
#[derive(Debug, Clone)]
pub struct CrawlSettings {
    pub max_concurrent_per_source: usize,
    /// Minimum spacing between page fetches to one source
    pub min_page_delay: Duration,
    /// Pages fetched before a request completes regardless of `next_page`
    pub max_pages: u32,
    /// Postings of a crawled source unseen for this long are deactivated
    pub stale_after: chrono::Duration,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            max_concurrent_per_source: 2,
            min_page_delay: Duration::from_secs(2),
            max_pages: 5,
            stale_after: chrono::Duration::days(30),
        }
    }
}

/// How the page loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CrawlEnd {
    Exhausted,
    PageCap,
    Cancelled,
}

struct SchedulerInner {
    store: Arc<dyn CrawlStore>,
    registry: JobRegistry,
    adapters: AdapterRegistry,
    limiters: SourceLimiters,
    meter: UsageMeter,
    settings: CrawlSettings,
    running: Mutex<HashMap<CrawlRequestId, CancellationToken>>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

/// Drops a request's cancellation token once its task ends, however it ends.
struct RunningEntry {
    inner: Arc<SchedulerInner>,
    id: CrawlRequestId,
}

impl Drop for RunningEntry {
    fn drop(&mut self) {
        if let Ok(mut running) = self.inner.running.lock() {
            running.remove(&self.id);
        }
    }
}

#[derive(Clone)]
pub struct CrawlScheduler {
    inner: Arc<SchedulerInner>,
}

impl CrawlScheduler {
    pub fn new(
        store: Arc<dyn CrawlStore>,
        registry: JobRegistry,
        adapters: AdapterRegistry,
        meter: UsageMeter,
        settings: CrawlSettings,
    ) -> Self {
        let limiters =
            SourceLimiters::new(settings.max_concurrent_per_source, settings.min_page_delay);
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                registry,
                adapters,
                limiters,
                meter,
                settings,
                running: Mutex::new(HashMap::new()),
                tasks: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn supported_sources(&self) -> Vec<JobSource> {
        self.inner.adapters.sources()
    }

    /// Fail requests a previous process left `queued` or `running`.
    pub async fn recover(&self) -> Result<u64> {
        let count = self
            .inner
            .store
            .fail_unfinished_crawls("crawl interrupted by restart")
            .await?;
        if count > 0 {
            warn!(count, "Marked orphaned crawl requests failed");
        }
        Ok(count)
    }

    /// Persist a `queued` request and start it in the background.
    pub async fn submit(
        &self,
        user_id: Option<UserId>,
        query: &str,
        location: Option<&str>,
        source: JobSource,
    ) -> Result<CrawlRequestId> {
        let adapter = self
            .inner
            .adapters
            .get(source)
            .ok_or(EngineError::UnsupportedSource(source))?;

        let request = CrawlRequest::queued(user_id, query, location.map(str::to_string), source);
        let id = request.id;
        self.inner.store.insert_crawl_request(&request).await?;

        let token = self.inner.shutdown.child_token();
        if let Ok(mut running) = self.inner.running.lock() {
            running.insert(id, token.clone());
        }

        info!(
            crawl_request_id = %id,
            source = %source,
            query = %request.search_query,
            "Crawl request queued"
        );

        let entry = RunningEntry {
            inner: self.inner.clone(),
            id,
        };
        self.inner.tasks.spawn(async move {
            entry.inner.execute(request, adapter, token).await;
        });

        Ok(id)
    }

    /// Cancel a request. Queued requests are cancelled immediately; running
    /// ones stop at the next page boundary.
    pub async fn cancel(&self, id: CrawlRequestId) -> Result<CancelOutcome> {
        let request = self.get(id).await?;
        if request.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyFinished(request.status));
        }

        let token = self
            .inner
            .running
            .lock()
            .ok()
            .and_then(|running| running.get(&id).cloned());
        if let Some(token) = &token {
            token.cancel();
        }

        if self
            .inner
            .store
            .transition_crawl_request(id, CrawlStatus::Queued, CrawlStatus::Cancelled, None)
            .await?
        {
            info!(crawl_request_id = %id, "Crawl request cancelled before start");
            return Ok(CancelOutcome::CancelledBeforeStart);
        }

        let current = self.get(id).await?;
        match current.status {
            CrawlStatus::Running if token.is_some() => {
                info!(crawl_request_id = %id, "Crawl cancellation requested");
                Ok(CancelOutcome::CancellationRequested)
            }
            CrawlStatus::Running => {
                // Owned by another process; this one cannot signal it
                warn!(crawl_request_id = %id, "Running crawl has no local task");
                Ok(CancelOutcome::CancellationRequested)
            }
            status => Ok(CancelOutcome::AlreadyFinished(status)),
        }
    }

    pub async fn get(&self, id: CrawlRequestId) -> Result<CrawlRequest> {
        self.inner
            .store
            .get_crawl_request(id)
            .await?
            .ok_or_else(|| EngineError::not_found("crawl request", id))
    }

    /// Most recent requests first.
    pub async fn list_recent(&self, limit: i64) -> Result<Vec<CrawlRequest>> {
        Ok(self.inner.store.list_crawl_requests(limit.clamp(1, 100)).await?)
    }

    pub fn running_count(&self) -> usize {
        self.inner.running.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Cancel every request and wait up to `grace` for tasks to finish.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.shutdown.cancel();
        self.inner.limiters.close_all();
        self.inner.tasks.close();

        if tokio::time::timeout(grace, self.inner.tasks.wait()).await.is_err() {
            warn!(
                remaining = self.inner.tasks.len(),
                "Crawl tasks still running after shutdown grace period"
            );
        } else {
            info!("Crawl scheduler stopped");
        }
    }
}

impl SchedulerInner {
    fn stop_reason(&self) -> Option<String> {
        self.shutdown
            .is_cancelled()
            .then(|| SHUTDOWN_MESSAGE.to_string())
    }

    async fn execute(
        &self,
        request: CrawlRequest,
        adapter: Arc<dyn SourceAdapter>,
        token: CancellationToken,
    ) {
        let id = request.id;
        let limiter = self.limiters.for_source(request.source);

        let _slot = tokio::select! {
            _ = token.cancelled() => {
                self.finish(id, CrawlStatus::Queued, CrawlStatus::Cancelled, self.stop_reason()).await;
                return;
            }
            slot = limiter.acquire() => match slot {
                Ok(slot) => slot,
                Err(_) => {
                    self.finish(id, CrawlStatus::Queued, CrawlStatus::Cancelled, self.stop_reason()).await;
                    return;
                }
            },
        };

        match self
            .store
            .transition_crawl_request(id, CrawlStatus::Queued, CrawlStatus::Running, None)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(crawl_request_id = %id, "Crawl request no longer queued; skipping");
                return;
            }
            Err(e) => {
                error!(crawl_request_id = %id, error = %e, "Failed to start crawl request");
                return;
            }
        }

        info!(crawl_request_id = %id, source = %request.source, "Crawl started");
        let mut progress = CrawlProgress::default();
        let outcome = AssertUnwindSafe(self.crawl_pages(
            &request,
            adapter.as_ref(),
            &limiter,
            &token,
            &mut progress,
        ))
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| {
            let message = panic_message(payload.as_ref());
            error!(crawl_request_id = %id, error = %message, "Crawl task panicked");
            Err(anyhow::anyhow!("crawl task panicked: {message}"))
        });

        match outcome {
            Ok(CrawlEnd::Cancelled) => {
                info!(
                    crawl_request_id = %id,
                    pages_fetched = progress.pages_fetched,
                    "Crawl cancelled"
                );
                self.finish(id, CrawlStatus::Running, CrawlStatus::Cancelled, self.stop_reason())
                    .await;
            }
            Ok(end) => {
                info!(
                    crawl_request_id = %id,
                    jobs_found = progress.jobs_found,
                    jobs_new = progress.jobs_new,
                    pages_fetched = progress.pages_fetched,
                    page_cap_reached = end == CrawlEnd::PageCap,
                    "Crawl completed"
                );
                self.finish(id, CrawlStatus::Running, CrawlStatus::Completed, None)
                    .await;

                let cutoff = Utc::now() - self.settings.stale_after;
                if let Err(e) = self.registry.deactivate_stale(request.source, cutoff).await {
                    warn!(source = %request.source, error = %e, "Failed to deactivate stale postings");
                }
            }
            Err(e) => {
                warn!(crawl_request_id = %id, error = %e, "Crawl failed");
                self.finish(
                    id,
                    CrawlStatus::Running,
                    CrawlStatus::Failed,
                    Some(e.to_string()),
                )
                .await;
            }
        }
    }

    async fn crawl_pages(
        &self,
        request: &CrawlRequest,
        adapter: &dyn SourceAdapter,
        limiter: &SourceLimiter,
        token: &CancellationToken,
        progress: &mut CrawlProgress,
    ) -> anyhow::Result<CrawlEnd> {
        let mut page: Option<PageToken> = None;
        loop {
            if token.is_cancelled() {
                return Ok(CrawlEnd::Cancelled);
            }
            if progress.pages_fetched as u32 >= self.settings.max_pages {
                return Ok(CrawlEnd::PageCap);
            }

            tokio::select! {
                _ = token.cancelled() => return Ok(CrawlEnd::Cancelled),
                _ = limiter.pace() => {}
            }

            let fetched = adapter
                .fetch_page(
                    &request.search_query,
                    request.location.as_deref(),
                    page.as_ref(),
                )
                .await;
            self.meter
                .record(request.user_id, ServiceTag::Crawl, UsageUnits::flat(1))
                .await;
            let fetched = fetched?;

            progress.pages_fetched += 1;
            for posting in &fetched.postings {
                let outcome = self.registry.upsert(posting).await?;
                progress.jobs_found += 1;
                if outcome.is_new {
                    progress.jobs_new += 1;
                }
            }
            self.store.record_crawl_progress(request.id, *progress).await?;

            debug!(
                crawl_request_id = %request.id,
                page = progress.pages_fetched,
                postings = fetched.postings.len(),
                "Crawled page"
            );

            match fetched.next_page {
                Some(next) => page = Some(next),
                None => return Ok(CrawlEnd::Exhausted),
            }
        }
    }

    async fn finish(
        &self,
        id: CrawlRequestId,
        from: CrawlStatus,
        to: CrawlStatus,
        error_message: Option<String>,
    ) {
        if !from.can_transition_to(to) {
            error!(crawl_request_id = %id, from = %from, to = %to, "Refusing illegal crawl transition");
            return;
        }
        match self
            .store
            .transition_crawl_request(id, from, to, error_message)
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!(crawl_request_id = %id, from = %from, to = %to, "Crawl status already changed"),
            Err(e) => error!(crawl_request_id = %id, to = %to, error = %e, "Failed to record crawl status"),
        }
    }
}

//! Per-source crawl limits.
//!
//! Each source gets a semaphore bounding concurrently running requests and a
//! pacing gate enforcing a minimum delay between page fetches. Both are shared
//! by every request against that source; requests beyond the limit queue on
//! the semaphore.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::domains::jobs::JobSource;

pub struct SourceLimiter {
    permits: Arc<Semaphore>,
    min_delay: Duration,
    next_fetch_at: tokio::sync::Mutex<Option<Instant>>,
}

impl SourceLimiter {
    pub fn new(max_concurrent: usize, min_delay: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            min_delay,
            next_fetch_at: tokio::sync::Mutex::new(None),
        }
    }

    /// Wait for a running slot. Fails only once the limiter is closed.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        self.permits.clone().acquire_owned().await
    }

    /// Wait until a page fetch is allowed, then reserve the next slot.
    pub async fn pace(&self) {
        let mut next = self.next_fetch_at.lock().await;
        if let Some(at) = *next {
            tokio::time::sleep_until(at).await;
        }
        *next = Some(Instant::now() + self.min_delay);
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn close(&self) {
        self.permits.close();
    }
}

/// Lazily created limiters, one per source.
pub struct SourceLimiters {
    max_concurrent: usize,
    min_delay: Duration,
    limiters: Mutex<HashMap<JobSource, Arc<SourceLimiter>>>,
}

impl SourceLimiters {
    pub fn new(max_concurrent: usize, min_delay: Duration) -> Self {
        Self {
            max_concurrent,
            min_delay,
            limiters: Mutex::new(HashMap::new()),
        }
    }

    pub fn for_source(&self, source: JobSource) -> Arc<SourceLimiter> {
        match self.limiters.lock() {
            Ok(mut limiters) => limiters
                .entry(source)
                .or_insert_with(|| {
                    Arc::new(SourceLimiter::new(self.max_concurrent, self.min_delay))
                })
                .clone(),
            // A poisoned map still yields a working, if unshared, limiter
            Err(_) => Arc::new(SourceLimiter::new(self.max_concurrent, self.min_delay)),
        }
    }

    pub fn close_all(&self) {
        if let Ok(limiters) = self.limiters.lock() {
            for limiter in limiters.values() {
                limiter.close();
            }
        }
    }
}

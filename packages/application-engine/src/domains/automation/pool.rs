//! Bounded pool of automation sessions.
//!
//! Capacity is a semaphore shared by every user. A lease owns its permit, so
//! the slot is freed however the lease ends: explicit `release`, an early
//! return, or a panic unwinding through the worker.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::session::{AutomationSession, SessionFactory};
use crate::error::ResourceExhausted;

type IdleSessions = Arc<Mutex<Vec<Box<dyn AutomationSession>>>>;

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error(transparent)]
    Exhausted(#[from] ResourceExhausted),

    #[error("failed to create automation session: {0:#}")]
    Factory(anyhow::Error),
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub capacity: usize,
    /// Slots not currently leased
    pub available: usize,
    /// Warm sessions waiting for reuse
    pub idle: usize,
}

pub struct SessionPool {
    factory: Arc<dyn SessionFactory>,
    permits: Arc<Semaphore>,
    idle: IdleSessions,
    capacity: usize,
}

impl SessionPool {
    pub fn new(factory: Arc<dyn SessionFactory>, capacity: usize) -> Self {
        Self {
            factory,
            permits: Arc::new(Semaphore::new(capacity)),
            idle: Arc::new(Mutex::new(Vec::new())),
            capacity,
        }
    }

    /// Wait up to `timeout` for a free slot, then hand out an idle session or
    /// create a new one.
    pub async fn acquire(&self, timeout: Duration) -> Result<SessionLease, AcquireError> {
        let permit = match tokio::time::timeout(timeout, self.permits.clone().acquire_owned()).await
        {
            Ok(Ok(permit)) => permit,
            // Elapsed, or the pool was shut down while waiting
            Ok(Err(_)) | Err(_) => {
                tracing::warn!(
                    capacity = self.capacity,
                    waited_ms = timeout.as_millis() as u64,
                    "Automation session pool exhausted"
                );
                return Err(ResourceExhausted {
                    capacity: self.capacity,
                    waited: timeout,
                }
                .into());
            }
        };

        let reused = self.idle.lock().ok().and_then(|mut idle| idle.pop());
        let session = match reused {
            Some(session) => session,
            None => {
                tracing::debug!("Creating automation session");
                self.factory.create().await.map_err(AcquireError::Factory)?
            }
        };

        Ok(SessionLease {
            session,
            healthy: true,
            idle: self.idle.clone(),
            _permit: permit,
        })
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            capacity: self.capacity,
            available: self.permits.available_permits(),
            idle: self.idle.lock().map(|idle| idle.len()).unwrap_or(0),
        }
    }

    /// Stop handing out sessions and close the idle ones. Leases already out
    /// keep working; their sessions are dropped on release.
    pub async fn shutdown(&self) {
        self.permits.close();
        let drained: Vec<_> = self
            .idle
            .lock()
            .map(|mut idle| idle.drain(..).collect())
            .unwrap_or_default();
        for mut session in drained {
            session.close().await;
        }
    }
}

/// Exclusive use of one session plus its capacity slot.
///
/// Dropping a lease without `release` discards the session; the slot is freed
/// either way.
pub struct SessionLease {
    session: Box<dyn AutomationSession>,
    healthy: bool,
    idle: IdleSessions,
    _permit: OwnedSemaphorePermit,
}

impl SessionLease {
    pub fn session(&mut self) -> &mut dyn AutomationSession {
        self.session.as_mut()
    }

    /// Flag the session as unusable; `release` will destroy it.
    pub fn mark_broken(&mut self) {
        self.healthy = false;
    }

    /// Return a healthy session to the idle set, or destroy a broken one.
    pub async fn release(self) {
        let SessionLease {
            mut session,
            healthy,
            idle,
            _permit: permit,
        } = self;

        if !healthy {
            tracing::debug!("Discarding errored automation session");
            session.close().await;
            return;
        }

        // Park the session before the permit drops so the next acquirer
        // finds it warm.
        let parked = match idle.lock() {
            Ok(mut idle) => {
                idle.push(session);
                true
            }
            Err(_) => false,
        };
        if !parked {
            tracing::warn!("Idle session set unavailable; dropping session");
        }
        drop(permit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::test_dependencies::MockSessionFactory;

    #[tokio::test]
    async fn acquire_times_out_when_saturated() {
        let factory = Arc::new(MockSessionFactory::new());
        let pool = SessionPool::new(factory, 1);

        let _held = pool.acquire(Duration::from_millis(50)).await.unwrap();
        let err = pool.acquire(Duration::from_millis(20)).await.err().unwrap();
        match err {
            AcquireError::Exhausted(e) => assert_eq!(e.capacity, 1),
            other => panic!("expected exhaustion, got {other}"),
        }
    }

    #[tokio::test]
    async fn healthy_sessions_are_reused() {
        let factory = Arc::new(MockSessionFactory::new());
        let pool = SessionPool::new(factory.clone(), 2);

        let lease = pool.acquire(Duration::from_millis(50)).await.unwrap();
        lease.release().await;
        assert_eq!(pool.status().idle, 1);

        let lease = pool.acquire(Duration::from_millis(50)).await.unwrap();
        lease.release().await;
        assert_eq!(factory.created(), 1);
        assert_eq!(pool.status().available, 2);
    }

    #[tokio::test]
    async fn broken_sessions_are_destroyed() {
        let factory = Arc::new(MockSessionFactory::new());
        let pool = SessionPool::new(factory.clone(), 1);

        let mut lease = pool.acquire(Duration::from_millis(50)).await.unwrap();
        lease.mark_broken();
        lease.release().await;
        assert_eq!(pool.status().idle, 0);
        assert_eq!(factory.closed(), 1);

        let lease = pool.acquire(Duration::from_millis(50)).await.unwrap();
        drop(lease);
        assert_eq!(factory.created(), 2);
    }

    #[tokio::test]
    async fn panicking_holder_frees_the_slot() {
        let factory = Arc::new(MockSessionFactory::new());
        let pool = Arc::new(SessionPool::new(factory, 1));

        let task_pool = pool.clone();
        let handle = tokio::spawn(async move {
            let _lease = task_pool.acquire(Duration::from_millis(50)).await.unwrap();
            panic!("automation blew up");
        });
        assert!(handle.await.is_err());

        assert_eq!(pool.status().available, 1);
        assert!(pool.acquire(Duration::from_millis(50)).await.is_ok());
    }
}

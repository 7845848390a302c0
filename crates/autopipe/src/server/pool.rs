//! Bounded pool of connection workers.
//!
//! This module defines the [`WorkerPool`] struct, which caps the number of
//! services running at once and supports coordinated shutdown via a shared
//! [`CancellationToken`].
//!
//! A worker slot is reserved *before* the next connection is accepted, so
//! when every worker is busy new connections wait in the listener's accept
//! backlog instead of spawning unbounded tasks.

use core::{future::Future, time::Duration};
use portable_atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    time::timeout,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// Counters describing what a pool has done so far.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub accepted: u64,
    pub rejected: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
    accepted: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    pub(crate) fn accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn finished(&self, failed: bool) {
        if failed {
            self.failed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.completed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> PoolStats {
        PoolStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// A fixed number of worker slots that run connection services.
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    workers: usize,
    tracker: TaskTracker,
    shutdown_token: CancellationToken,
    shutdown_timeout: Duration,
    counters: Arc<Counters>,
}

impl WorkerPool {
    pub fn new(workers: usize, shutdown_token: CancellationToken, shutdown_timeout: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers)),
            workers,
            tracker: TaskTracker::new(),
            shutdown_token,
            shutdown_timeout,
            counters: Arc::new(Counters::default()),
        }
    }

    pub const fn workers(&self) -> usize {
        self.workers
    }

    /// Number of services currently running.
    pub fn busy(&self) -> usize {
        self.workers - self.permits.available_permits()
    }

    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot()
    }

    pub(crate) fn counters(&self) -> Arc<Counters> {
        Arc::clone(&self.counters)
    }

    /// Token cancelled when remaining work must stop.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown_token
    }

    /// Waits until a worker is free and reserves it.
    ///
    /// Returns `None` once the pool is shutting down.
    pub async fn reserve(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.permits).acquire_owned().await.ok()
    }

    /// Runs `work` on the worker reserved by `permit`.
    pub fn spawn<Fut>(&self, permit: OwnedSemaphorePermit, work: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(async move {
            work.await;
            drop(permit);
        });
    }

    /// Gracefully shuts down the pool.
    ///
    /// - Refuses new reservations.
    /// - Waits up to `shutdown_timeout` for running services to finish.
    /// - Cancels whatever is still running and waits for it to stop.
    pub async fn shutdown(&self) {
        // === Phase 0: Stop handing out workers ===
        self.permits.close();
        self.tracker.close();

        // === Phase 1: Wait for in-flight services to drain ===
        #[cfg(feature = "tracing")]
        tracing::info!("Draining in-flight services ({} active)", self.tracker.len());
        let drained = timeout(self.shutdown_timeout, self.tracker.wait()).await;

        match drained {
            Ok(()) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("All in-flight services drained");
            }
            Err(_) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    "Graceful drain timed out ({} services still active)",
                    self.tracker.len()
                );
            }
        }

        // === Phase 2: Cancel any remaining work ===
        self.shutdown_token.cancel();
        self.tracker.wait().await;

        #[cfg(feature = "tracing")]
        tracing::info!("Worker pool shutdown complete");
    }
}

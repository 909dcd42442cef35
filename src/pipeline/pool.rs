//! # Bounded Execution Pool
//!
//! Caps how many transcriber processes run at once. Transcription is
//! CPU-bound and slow, so its budget is separate from the download queue's:
//! a download can proceed while a previous video is still being transcribed.
//!
//! Admission is FIFO: `tokio::sync::Semaphore` hands permits out in the order
//! `acquire` was called, so once the pool is saturated waiters are admitted
//! strictly in arrival order.

use crate::error::{PipelineError, PipelineResult};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub limit: usize,
    pub running: usize,
    pub waiting: usize,
}

/// Concurrency limiter for the transformation stage.
#[derive(Clone)]
pub struct ExecutionPool {
    permits: Arc<Semaphore>,
    limit: usize,
    waiting: Arc<AtomicUsize>,
}

impl ExecutionPool {
    /// `limit` is clamped to at least one slot.
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
            waiting: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wait for a free slot, then run `task` while holding it.
    ///
    /// The slot is released when `task` finishes, fails, or is dropped
    /// (for example by an enclosing timeout).
    pub async fn run<T, Fut>(&self, task: Fut) -> PipelineResult<T>
    where
        Fut: Future<Output = PipelineResult<T>>,
    {
        let permit = {
            let _waiting = WaitingGuard::enter(&self.waiting);
            self.permits.acquire().await
        };
        let _permit = permit.map_err(|_| PipelineError::Io("execution pool is closed".to_string()))?;

        task.await
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            limit: self.limit,
            running: self.limit - self.permits.available_permits(),
            waiting: self.waiting.load(Ordering::Relaxed),
        }
    }
}

/// Keeps the waiting counter right even if the caller is cancelled mid-wait.
struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

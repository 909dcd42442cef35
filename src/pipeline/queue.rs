//! # Rate-Limited Submission Queue
//!
//! Serializes every upstream submission (downloads and metadata lookups) so the
//! video host only ever sees one request at a time, with a randomized pause
//! between consecutive requests.
//!
//! ## Behaviour:
//! - Strict FIFO, exactly one task running at a time
//! - After a task finishes, if more tasks are waiting, sleep `min_gap ± jitter`
//! - When the queue is empty the worker just waits on the channel (no timer),
//!   so a submission to an idle queue starts immediately
//! - Each task's outcome goes back to exactly one caller through a oneshot channel
//! - No retries here: a task that retries internally holds its slot for its
//!   whole retry lifetime, which keeps the spacing guarantee across retries

use crate::error::{PipelineError, PipelineResult};
use rand::Rng;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

type QueuedTask = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Handle to the submission queue. Cloning shares the same worker.
#[derive(Clone)]
pub struct SubmissionQueue {
    tx: mpsc::UnboundedSender<QueuedTask>,
    pending: Arc<AtomicUsize>,
}

impl SubmissionQueue {
    /// Create the queue and spawn its worker on the current tokio runtime.
    ///
    /// The worker exits once every `SubmissionQueue` handle has been dropped.
    pub fn new(min_gap: Duration, jitter: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        tokio::spawn(run_worker(rx, pending.clone(), min_gap, jitter));
        Self { tx, pending }
    }

    /// Tasks submitted but not yet finished (including the running one).
    pub fn depth(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Queue `task` and wait for its result.
    ///
    /// ## Rust Concepts:
    /// - **Type erasure**: the task is wrapped in a boxed `Future<Output = ()>` that
    ///   forwards its typed result through a oneshot, so one channel can carry
    ///   tasks with different output types
    /// - **'static bound**: the worker owns the task, so it cannot borrow from the caller
    pub async fn submit<T, Fut>(&self, task: Fut) -> PipelineResult<T>
    where
        T: Send + 'static,
        Fut: Future<Output = PipelineResult<T>> + Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let wrapped: QueuedTask = Box::pin(async move {
            let outcome = task.await;
            // The caller may have given up (e.g. its timeout fired); nothing to do then.
            let _ = result_tx.send(outcome);
        });

        self.pending.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(wrapped).is_err() {
            self.pending.fetch_sub(1, Ordering::Relaxed);
            return Err(PipelineError::Io("submission queue is shut down".to_string()));
        }

        result_rx
            .await
            .map_err(|_| PipelineError::Io("submission queue dropped the task".to_string()))?
    }
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<QueuedTask>,
    pending: Arc<AtomicUsize>,
    min_gap: Duration,
    jitter: Duration,
) {
    while let Some(task) = rx.recv().await {
        task.await;
        pending.fetch_sub(1, Ordering::Relaxed);

        if !rx.is_empty() {
            let pause = jittered_gap(min_gap, jitter);
            trace!(pause_ms = pause.as_millis() as u64, "Spacing next submission");
            tokio::time::sleep(pause).await;
        }
    }
    debug!("Submission queue worker stopped");
}

/// `min_gap` shifted by a uniformly random offset in `[-jitter, +jitter]`, never negative.
pub fn jittered_gap(min_gap: Duration, jitter: Duration) -> Duration {
    let jitter_ms = jitter.as_millis() as i64;
    let offset = if jitter_ms == 0 {
        0
    } else {
        rand::rng().random_range(-jitter_ms..=jitter_ms)
    };
    let gap_ms = (min_gap.as_millis() as i64 + offset).max(0);
    Duration::from_millis(gap_ms as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::time::Instant;

    #[test]
    fn test_jittered_gap_stays_in_window() {
        let gap = Duration::from_millis(1000);
        let jitter = Duration::from_millis(300);
        for _ in 0..500 {
            let pause = jittered_gap(gap, jitter);
            assert!(pause >= Duration::from_millis(700));
            assert!(pause <= Duration::from_millis(1300));
        }
        assert_eq!(jittered_gap(gap, Duration::ZERO), gap);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tasks_run_in_order_with_spacing() {
        let gap = Duration::from_millis(1000);
        let jitter = Duration::from_millis(200);
        let queue = SubmissionQueue::new(gap, jitter);
        let log: Arc<Mutex<Vec<(usize, Instant, Instant)>>> = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for n in 0..4 {
            let queue = queue.clone();
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .submit(async move {
                        let started = Instant::now();
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        log.lock().unwrap().push((n, started, Instant::now()));
                        Ok(n)
                    })
                    .await
            }));
            // Make submission order deterministic.
            tokio::task::yield_now().await;
        }

        for (n, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap().unwrap(), n);
        }

        let log = log.lock().unwrap();
        let order: Vec<usize> = log.iter().map(|(n, _, _)| *n).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
        for pair in log.windows(2) {
            let (_, _, prev_done) = pair[0];
            let (_, next_start, _) = pair[1];
            assert!(next_start.duration_since(prev_done) >= gap - jitter);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_queue_starts_immediately() {
        let queue = SubmissionQueue::new(Duration::from_secs(10), Duration::from_secs(1));
        let before = Instant::now();
        let value = queue.submit(async { Ok::<_, PipelineError>(7) }).await.unwrap();
        assert_eq!(value, 7);
        assert!(before.elapsed() < Duration::from_millis(10));

        // The queue went idle after the first task, so this one does not wait either.
        let before = Instant::now();
        queue.submit(async { Ok::<_, PipelineError>(()) }).await.unwrap();
        assert!(before.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_delivered_and_do_not_stop_the_queue() {
        let queue = SubmissionQueue::new(Duration::from_millis(100), Duration::ZERO);

        let first = queue.clone();
        let failing = tokio::spawn(async move {
            first
                .submit(async { Err::<(), _>(PipelineError::FatalTransport("boom".into())) })
                .await
        });
        tokio::task::yield_now().await;
        let second = queue.submit(async { Ok::<_, PipelineError>("ok") }).await;

        assert_eq!(
            failing.await.unwrap(),
            Err(PipelineError::FatalTransport("boom".into()))
        );
        assert_eq!(second, Ok("ok"));
        assert_eq!(queue.depth(), 0);
    }
}

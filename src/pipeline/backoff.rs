//! # Retry With Exponential Backoff
//!
//! Wraps one fallible async operation. Transient failures are retried with
//! `delay = min(max_delay, base * 2^attempt) * U[0.5, 1.0)`; anything the
//! classifier rejects propagates on the spot.
//!
//! ## Budget semantics:
//! `max_retries` counts retries *after* the first attempt, so an operation that
//! fails transiently K times and then succeeds needs `max_retries >= K`.
//! Running out of budget yields [`PipelineError::RetriesExhausted`] carrying the
//! last error.

use crate::error::{PipelineError, PipelineResult, Stage};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// How many times to retry and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// No retries at all: the first failure is final.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    /// Upper bound of the delay before retry number `attempt` (0-based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Randomized delay in `[ceiling / 2, ceiling)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier: f64 = rand::rng().random_range(0.5..1.0);
        self.ceiling(attempt).mul_f64(multiplier)
    }
}

/// Run `operation` until it succeeds, fails fatally, or the budget runs out.
///
/// ## Parameters:
/// - **policy**: retry budget and delay curve
/// - **stage**: used for logging and for the `Cancelled` error
/// - **cancel**: aborts the wait between attempts (shutdown)
/// - **is_transient**: decides which errors deserve another attempt
/// - **operation**: called once per attempt with the 0-based attempt number
pub async fn retry_with_backoff<T, F, Fut, C>(
    policy: RetryPolicy,
    stage: Stage,
    cancel: &CancellationToken,
    is_transient: C,
    mut operation: F,
) -> PipelineResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = PipelineResult<T>>,
    C: Fn(&PipelineError) -> bool,
{
    let mut attempt: u32 = 0;
    loop {
        let err = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !is_transient(&err) {
            return Err(err);
        }

        if attempt >= policy.max_retries {
            return Err(PipelineError::RetriesExhausted {
                attempts: attempt + 1,
                last: Box::new(err),
            });
        }

        let delay = policy.delay_for(attempt);
        warn!(
            stage = %stage,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Transient failure, backing off"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled(stage)),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_millis(100), Duration::from_secs(10))
    }

    /// Fails with a rate-limit error `failures` times, then returns "done".
    fn flaky(
        failures: u32,
        calls: Arc<AtomicU32>,
        stamps: Arc<Mutex<Vec<Instant>>>,
    ) -> impl FnMut(u32) -> std::pin::Pin<Box<dyn Future<Output = PipelineResult<&'static str>> + Send>> {
        move |_| {
            let calls = calls.clone();
            let stamps = stamps.clone();
            Box::pin(async move {
                stamps.lock().unwrap().push(Instant::now());
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < failures {
                    Err(PipelineError::RetriableTransport("HTTP Error 429".into()))
                } else {
                    Ok("done")
                }
            })
        }
    }

    #[test]
    fn test_ceiling_doubles_and_caps() {
        let p = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_millis(1000));
        assert_eq!(p.ceiling(0), Duration::from_millis(100));
        assert_eq!(p.ceiling(1), Duration::from_millis(200));
        assert_eq!(p.ceiling(3), Duration::from_millis(800));
        assert_eq!(p.ceiling(4), Duration::from_millis(1000));
        assert_eq!(p.ceiling(40), Duration::from_millis(1000));
    }

    #[test]
    fn test_delay_is_randomized_below_ceiling() {
        let p = policy(5);
        for attempt in 0..5 {
            let delay = p.delay_for(attempt);
            assert!(delay >= p.ceiling(attempt) / 2);
            assert!(delay < p.ceiling(attempt));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_within_budget_with_growing_delays() {
        let calls = Arc::new(AtomicU32::new(0));
        let stamps = Arc::new(Mutex::new(Vec::new()));
        let token = CancellationToken::new();

        let result = retry_with_backoff(
            policy(3),
            Stage::Fetch,
            &token,
            PipelineError::is_retriable,
            flaky(3, calls.clone(), stamps.clone()),
        )
        .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        let stamps = stamps.lock().unwrap();
        let gaps: Vec<Duration> = stamps.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(gaps.len(), 3);
        assert!(gaps[0] < gaps[1]);
        assert!(gaps[1] < gaps[2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();

        let result = retry_with_backoff(
            policy(2),
            Stage::Fetch,
            &token,
            PipelineError::is_retriable,
            flaky(5, calls.clone(), Arc::new(Mutex::new(Vec::new()))),
        )
        .await;

        match result {
            Err(PipelineError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(last.is_retriable());
            }
            other => panic!("expected RetriesExhausted, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();
        let counter = calls.clone();

        let result: PipelineResult<()> = retry_with_backoff(
            policy(5),
            Stage::Fetch,
            &token,
            PipelineError::is_retriable,
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(PipelineError::FatalTransport("Video unavailable".into())) }
            },
        )
        .await;

        assert_eq!(result, Err(PipelineError::FatalTransport("Video unavailable".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_backoff() {
        let token = CancellationToken::new();
        token.cancel();

        let result: PipelineResult<()> = retry_with_backoff(
            policy(5),
            Stage::Transcribe,
            &token,
            |_| true,
            |_| async { Err(PipelineError::TransformFailure("exit 1".into())) },
        )
        .await;

        assert_eq!(result, Err(PipelineError::Cancelled(Stage::Transcribe)));
    }
}

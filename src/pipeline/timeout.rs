//! # Stage Timeouts
//!
//! Puts a hard ceiling on one stage. The operation receives a child
//! [`CancellationToken`]; when the deadline passes the token is cancelled, the
//! operation's future is dropped (which kills any child process spawned with
//! `kill_on_drop`), and the caller gets [`PipelineError::OperationTimedOut`].
//! Whatever the aborted operation would have returned afterwards is never seen.

use crate::error::{PipelineError, PipelineResult, Stage};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Run `operation` with at most `limit` to finish.
///
/// `parent` is usually the service-wide shutdown token; cancelling it also
/// cancels the token handed to `operation`, but a timeout here never
/// cancels the parent or sibling stages.
pub async fn with_timeout<T, F, Fut>(
    limit: Duration,
    stage: Stage,
    parent: &CancellationToken,
    operation: F,
) -> PipelineResult<T>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = PipelineResult<T>>,
{
    let token = parent.child_token();
    match tokio::time::timeout(limit, operation(token.clone())).await {
        Ok(result) => result,
        Err(_) => {
            token.cancel();
            warn!(stage = %stage, limit_ms = limit.as_millis() as u64, "Stage timed out");
            Err(PipelineError::OperationTimedOut { stage, after: limit })
        }
    }
}

//! Stage-level retry with exponential backoff.

use std::future::Future;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::domain::{JobStage, RetryPolicy};
use crate::{Error, Result};

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy runs out of attempts. The last error is returned.
///
/// `op` receives the 1-indexed attempt number. Shutdown interrupts the
/// backoff sleep and prevents further attempts.
pub async fn retry_stage<T, F, Fut>(
    policy: &RetryPolicy,
    shutdown: &CancellationToken,
    job_id: &str,
    stage: JobStage,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1u32;
    loop {
        if shutdown.is_cancelled() {
            return Err(Error::Cancelled(format!("{stage} stage not started")));
        }

        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_retryable() || !policy.should_retry(attempt) {
            return Err(err);
        }

        let delay = policy.delay_after_attempt(attempt);
        warn!(
            job_id,
            %stage,
            attempt,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Stage failed, retrying"
        );

        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown.cancelled() => {
                return Err(Error::Cancelled(format!("{stage} retry interrupted")));
            }
        }
        attempt += 1;
    }
}

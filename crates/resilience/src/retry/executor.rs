//! Retry loop with backoff, jitter and cancellation.

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use fluxora_core::{ResilienceError, ResilienceResult};
use fluxora_observability::{ResilienceEvent, SharedMetricsSink};

use super::policy::RetryPolicy;

/// Runs an operation until it succeeds, fails with a non-retryable error,
/// runs out of attempts, or is cancelled.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    metrics: SharedMetricsSink,
}

impl RetryExecutor {
    pub fn new(metrics: SharedMetricsSink) -> Self {
        Self { metrics }
    }

    /// Execute `op` under `policy`.
    ///
    /// `op` receives the 1-based attempt number. `operation` labels logs and
    /// metrics. The token is checked before each attempt and raced against
    /// both the attempt and the backoff sleep; cancellation always yields
    /// `Cancelled`.
    pub async fn execute<T, F, Fut>(
        &self,
        operation: &str,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        mut op: F,
    ) -> ResilienceResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = ResilienceResult<T>>,
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(ResilienceError::Cancelled);
            }
            attempt += 1;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ResilienceError::Cancelled),
                res = op(attempt) => res,
            };

            let err = match result {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(ResilienceError::Cancelled) => return Err(ResilienceError::Cancelled),
                Err(err) => err,
            };

            if !policy.classifier.is_retryable(&err) {
                debug!(operation, attempt, error = %err, "non-retryable failure");
                return Err(err);
            }

            if attempt >= max_attempts {
                warn!(operation, attempts = attempt, error = %err, "retry budget exhausted");
                self.metrics.record(ResilienceEvent::RetriesExhausted {
                    operation: operation.to_string(),
                    attempts: attempt,
                });
                return Err(ResilienceError::RetriesExhausted {
                    attempts: attempt,
                    last_error: Box::new(err),
                });
            }

            let delay = policy.delay_for_attempt(attempt, &mut rand::thread_rng());
            debug!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying after failure"
            );
            self.metrics.record(ResilienceEvent::RetryScheduled {
                operation: operation.to_string(),
                attempt,
                delay,
            });

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ResilienceError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

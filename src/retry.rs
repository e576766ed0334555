//! Retry policies deciding whether and when a failed call is re-attempted.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{GiveUpReason, LLMError};

/// Decides whether a failed asynchronous task is re-run.
///
/// Attempts of one logical call are strictly sequential. Cancellation is never
/// retried: a task failing with an abort-flagged error, or the token firing during
/// a backoff delay, surfaces immediately with reason
/// [`GiveUpReason::Aborted`].
#[derive(Debug, Clone)]
pub enum RetryPolicy {
    /// Single attempt; the first failure is surfaced immediately.
    Never,
    /// Re-attempts retryable failures with exponentially growing delays.
    ExponentialBackoff {
        /// Total number of attempts, including the first one.
        max_tries: u32,
        /// Delay before the second attempt.
        initial_delay: Duration,
        /// Multiplier applied per attempt: delay = `initial_delay * factor^attempt`.
        factor: f64,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::Never
    }
}

impl RetryPolicy {
    /// Convenience constructor for [`RetryPolicy::ExponentialBackoff`].
    pub fn exponential_backoff(max_tries: u32, initial_delay: Duration, factor: f64) -> Self {
        Self::ExponentialBackoff {
            max_tries: max_tries.max(1),
            initial_delay,
            factor,
        }
    }

    /// Runs `task`, re-attempting per policy.
    ///
    /// Every intermediate error is collected; the surfaced
    /// [`LLMError::RetriesExhausted`] reports the full attempt history plus the
    /// give-up reason.
    ///
    /// # Errors
    ///
    /// - [`GiveUpReason::MaxTriesExceeded`] once `max_tries` attempts failed retryably.
    /// - [`GiveUpReason::ErrorNotRetryable`] on the first non-retryable failure.
    /// - [`GiveUpReason::Aborted`] when the task was cancelled or the token fired
    ///   during a backoff delay.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut task: F,
    ) -> Result<T, LLMError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LLMError>>,
    {
        match self {
            Self::Never => match task().await {
                Ok(value) => Ok(value),
                Err(err) => {
                    let reason = if err.is_abort() {
                        GiveUpReason::Aborted
                    } else {
                        GiveUpReason::ErrorNotRetryable
                    };
                    Err(LLMError::RetriesExhausted {
                        reason,
                        errors: vec![err],
                    })
                }
            },
            Self::ExponentialBackoff {
                max_tries,
                initial_delay,
                factor,
            } => {
                let mut errors: Vec<LLMError> = Vec::new();
                for attempt in 0..*max_tries {
                    match task().await {
                        Ok(value) => return Ok(value),
                        Err(err) => {
                            let aborted = err.is_abort();
                            let retryable = err.is_retryable();
                            tracing::debug!(
                                attempt,
                                retryable,
                                error = %err,
                                "call attempt failed"
                            );
                            errors.push(err);

                            if aborted {
                                return Err(LLMError::RetriesExhausted {
                                    reason: GiveUpReason::Aborted,
                                    errors,
                                });
                            }
                            if !retryable {
                                return Err(LLMError::RetriesExhausted {
                                    reason: GiveUpReason::ErrorNotRetryable,
                                    errors,
                                });
                            }
                            if attempt + 1 == *max_tries {
                                break;
                            }

                            let delay = backoff_delay(*initial_delay, *factor, attempt);
                            tokio::select! {
                                biased;
                                _ = cancel.cancelled() => {
                                    return Err(LLMError::RetriesExhausted {
                                        reason: GiveUpReason::Aborted,
                                        errors,
                                    });
                                }
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                    }
                }
                Err(LLMError::RetriesExhausted {
                    reason: GiveUpReason::MaxTriesExceeded,
                    errors,
                })
            }
        }
    }
}

fn backoff_delay(initial: Duration, factor: f64, attempt: u32) -> Duration {
    let factor = factor.max(0.0);
    initial.mul_f64(factor.powi(attempt as i32))
}

//! Admission control limiting concurrently executing remote calls.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::LLMError;

/// Decides whether a task runs immediately or waits for a concurrency slot.
///
/// `MaxConcurrency` is backed by a fair counting semaphore, so queued tasks are
/// admitted in strict FIFO order. The permit is released on every exit path
/// (success, failure, panic unwind), which means a failing task never blocks the
/// next queued one. The bound applies per policy instance, not globally; clones
/// share the same semaphore.
#[derive(Debug, Clone)]
pub enum ThrottlePolicy {
    /// Executes immediately, no queueing.
    Off,
    /// At most `limit` tasks run at once; the rest wait FIFO.
    MaxConcurrency {
        semaphore: Arc<Semaphore>,
        limit: usize,
    },
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self::Off
    }
}

impl ThrottlePolicy {
    /// Creates a policy admitting at most `limit` concurrent tasks.
    pub fn max_concurrency(limit: usize) -> Self {
        Self::MaxConcurrency {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Number of free slots, or `None` for [`ThrottlePolicy::Off`].
    pub fn available_slots(&self) -> Option<usize> {
        match self {
            Self::Off => None,
            Self::MaxConcurrency { semaphore, .. } => Some(semaphore.available_permits()),
        }
    }

    /// Runs `task` once admission is granted.
    ///
    /// Waiting for a slot races the cancellation token, so a cancelled call leaves
    /// the queue without ever holding a slot.
    ///
    /// # Errors
    ///
    /// [`LLMError::Aborted`] when cancelled while queued; otherwise whatever the
    /// task returns.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, task: F) -> Result<T, LLMError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, LLMError>>,
    {
        match self {
            Self::Off => task().await,
            Self::MaxConcurrency { semaphore, limit } => {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return Err(LLMError::aborted(
                            "cancelled while waiting for a concurrency slot",
                        ));
                    }
                    permit = semaphore.acquire() => permit.map_err(|_| {
                        LLMError::aborted("concurrency queue shut down")
                    })?,
                };
                tracing::trace!(limit, "concurrency slot acquired");
                task().await
            }
        }
    }
}

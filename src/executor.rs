//! Composition of retry and throttle policies around one remote call.

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::LLMError;
use crate::retry::RetryPolicy;
use crate::throttle::ThrottlePolicy;

/// Runs `call` under both policies: the retry policy wraps a closure that asks the
/// throttle policy for a slot.
///
/// The ordering matters: each retry attempt competes again for a concurrency slot,
/// so a call backing off between attempts holds no slot while it waits and other
/// queued calls are admitted in the meantime.
///
/// Defaults ([`RetryPolicy::Never`], [`ThrottlePolicy::Off`]) reproduce a plain
/// single-shot call; there is no process-wide policy state.
pub async fn call_with_retry_and_throttle<T, F, Fut>(
    retry: &RetryPolicy,
    throttle: &ThrottlePolicy,
    cancel: &CancellationToken,
    call: F,
) -> Result<T, LLMError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, LLMError>>,
{
    retry
        .run(cancel, || throttle.run(cancel, || call()))
        .await
}

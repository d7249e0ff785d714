//! Bounded retry of a single authority operation.
//!
//! Turns a [`RetryPolicy`] into an exponential backoff schedule and runs the
//! call under it. Only transient failures are retried; unavailability and
//! rejections return at once.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::future::Future;
use tracing::{debug, warn};

use crate::gateway::{with_timeout, AuthorityError, AuthorityResult};
use fiscal_core::RetryPolicy;

/// Exponential schedule for the waits between attempts.
pub(crate) fn backoff_for(policy: &RetryPolicy) -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: policy.initial_interval,
        // The first wait is drawn from `current_interval`, not `initial_interval`.
        current_interval: policy.initial_interval,
        max_interval: policy.max_interval,
        multiplier: policy.multiplier,
        max_elapsed_time: None, // the attempt count bounds the retry
        ..Default::default()
    }
}

/// Runs `call` until it succeeds, fails non-transiently, or the budget is
/// spent. Every attempt is bounded by `policy.attempt_timeout`.
///
/// `on_transient` runs with the attempt number and error after each
/// transient failure that will be retried.
pub(crate) async fn call_with_retry<T, F, Fut, H, HFut>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut call: F,
    mut on_transient: H,
) -> AuthorityResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AuthorityResult<T>>,
    H: FnMut(u32, AuthorityError) -> HFut,
    HFut: Future<Output = ()>,
{
    let mut backoff = backoff_for(policy);
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        match with_timeout(policy.attempt_timeout, call()).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "Authority call succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if e.is_transient() && policy.allows_attempt(attempt + 1) => {
                warn!(operation, attempt, error = %e, "Transient authority failure, retrying");
                on_transient(attempt, e).await;
                let wait = backoff.next_backoff().unwrap_or(policy.max_interval);
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
            }
            Err(e) => {
                debug!(operation, attempt, error = %e, "Authority call failed");
                return Err(e);
            }
        }
    }
}

/// No-op hook for callers that do not track attempts.
pub(crate) async fn ignore_attempt(_attempt: u32, _error: AuthorityError) {}

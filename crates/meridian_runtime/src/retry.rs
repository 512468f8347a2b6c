//! Retry driver for backend calls.

use crate::backend::BackendError;
use meridian_core::{NodeId, RetryPolicy};
use std::future::Future;
use std::time::Duration;

/// Result of a retried call with the number of attempts it took
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOutcome<T> {
    /// Final result
    pub value: Result<T, BackendError>,
    /// Attempts made, at least one
    pub attempts: u32,
}

/// Run `call` under the per-call timeout, retrying transient errors.
///
/// A timeout counts as a transient error. Permanent errors return on the
/// first attempt.
pub async fn call_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    timeout: Duration,
    node: &NodeId,
    operation: &'static str,
    mut call: F,
) -> CallOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = match tokio::time::timeout(timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(timeout)),
        };

        match result {
            Ok(value) => {
                tracing::debug!(node = %node, operation, attempt, "backend call succeeded");
                return CallOutcome {
                    value: Ok(value),
                    attempts: attempt,
                };
            }
            Err(err) if err.is_transient() && policy.should_retry(attempt) => {
                let delay = policy.backoff_for(attempt);
                tracing::warn!(
                    node = %node,
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient backend error, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                tracing::debug!(node = %node, operation, attempt, error = %err, "backend call failed");
                return CallOutcome {
                    value: Err(err),
                    attempts: attempt,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts).with_initial_backoff(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_errors() {
        let calls = AtomicU32::new(0);
        let calls_ref = &calls;
        let outcome = call_with_retry(&fast(5), Duration::from_secs(1), &NodeId::new("n"), "create", move || async move {
            if calls_ref.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(BackendError::RateLimited("throttled".into()))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(outcome.value, Ok(7));
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let calls_ref = &calls;
        let outcome: CallOutcome<()> = call_with_retry(&fast(5), Duration::from_secs(1), &NodeId::new("n"), "create", move || async move {
            calls_ref.fetch_add(1, Ordering::SeqCst);
            Err(BackendError::PermissionDenied("iam".into()))
        })
        .await;

        assert!(matches!(outcome.value, Err(BackendError::PermissionDenied(_))));
        assert_eq!(outcome.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempts_bounded() {
        let outcome: CallOutcome<()> = call_with_retry(&fast(3), Duration::from_secs(1), &NodeId::new("n"), "update", || async {
            Err(BackendError::Unavailable("down".into()))
        })
        .await;

        assert!(matches!(outcome.value, Err(BackendError::Unavailable(_))));
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let calls = AtomicU32::new(0);
        let calls_ref = &calls;
        let outcome = call_with_retry(&fast(2), Duration::from_millis(20), &NodeId::new("n"), "create", move || async move {
            if calls_ref.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Ok("done")
        })
        .await;

        assert_eq!(outcome.value, Ok("done"));
        assert_eq!(outcome.attempts, 2);
    }
}

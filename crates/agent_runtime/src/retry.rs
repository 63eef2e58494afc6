//! Bounded retry helpers for store calls.

use std::future::Future;
use std::time::Duration;

use database::StoreError;
use tracing::warn;

/// Linear backoff between store retries.
pub const STORE_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Default attempt budget for store calls.
pub const STORE_RETRY_ATTEMPTS: usize = 3;

/// Retries `op` on `Transient` store errors with linear backoff.
///
/// `Conflict`, `NotFound`, and `Permanent` are returned immediately; the
/// final `Transient` is returned once `attempts` is exhausted.
///
/// # Errors
///
/// Returns the last error produced by `op`.
pub async fn retry_transient<T, F, Fut>(
    what: &str,
    attempts: usize,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let attempts = attempts.max(1);
    let mut last = None;

    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < attempts => {
                warn!(
                    what,
                    attempt,
                    attempts,
                    error = %err,
                    "Transient store failure, retrying"
                );
                last = Some(err);
                tokio::time::sleep(STORE_RETRY_DELAY).await;
            }
            Err(err) => return Err(err),
        }
    }

    Err(last.unwrap_or_else(|| StoreError::Permanent(format!("{what}: no attempts made"))))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_until_success() {
        let calls = AtomicUsize::new(0);
        let result = retry_transient("op", 3, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(StoreError::Transient("flaky".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflict_is_never_retried() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = retry_transient("op", 3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Conflict("taken".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion_returns_last_error() {
        let result: Result<(), _> = retry_transient("op", 3, || async {
            Err(StoreError::Transient("still down".to_string()))
        })
        .await;
        assert!(matches!(result, Err(StoreError::Transient(_))));
    }
}

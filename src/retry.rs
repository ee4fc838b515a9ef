//! Conflict retry for optimistic-concurrency updates.
//!
//! Every write against the claim store is read-modify-update with the object's
//! resourceVersion carried along; a concurrent writer makes the update fail
//! with a conflict. [`retry_on_conflict`] re-runs the whole closure, which
//! must re-read the object and re-derive its mutation from the fresh state on
//! each attempt.

use std::time::Duration;

use tracing::{debug, warn};

use crate::Error;

/// Default number of attempts, matching the platform's conflict-retry convention.
pub const DEFAULT_ATTEMPTS: u32 = 5;

/// Base delay between attempts; grows linearly per attempt.
const BASE_DELAY: Duration = Duration::from_millis(10);

/// Run `operation` until it succeeds or fails with a non-conflict error.
///
/// Conflicts are retried up to `max_attempts` times with a short linear
/// backoff; the final conflict is returned to the caller. Any other error
/// aborts immediately.
pub async fn retry_on_conflict<F, Fut, T>(
    max_attempts: u32,
    operation_name: &str,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, Error>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_conflict() && attempt < max_attempts => {
                debug!(
                    operation = %operation_name,
                    attempt,
                    "conflict, retrying with fresh read"
                );
                tokio::time::sleep(BASE_DELAY * attempt).await;
            }
            Err(e) => {
                if e.is_conflict() {
                    warn!(
                        operation = %operation_name,
                        attempt,
                        "conflict retries exhausted"
                    );
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_immediately() {
        let result = retry_on_conflict(3, "op", || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn retries_conflicts_until_success() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result = retry_on_conflict(5, "op", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::conflict("lost the race"))
                } else {
                    Ok("won")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "won");
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_attempts_on_persistent_conflict() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<(), Error> = retry_on_conflict(3, "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::conflict("always loses"))
            }
        })
        .await;

        assert!(result.unwrap_err().is_conflict());
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_conflict_errors_abort_immediately() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<(), Error> = retry_on_conflict(5, "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::Timeout)
            }
        })
        .await;

        assert!(matches!(result.unwrap_err(), Error::Timeout));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}

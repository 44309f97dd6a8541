//! Retry policy for read-only storage operations.
//!
//! Only wrap reads with [`ReadRetry::run`]: a retried write could apply its
//! effect twice.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Classifies errors that may succeed when the same operation is repeated.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Fixed-sleep retry budget for read operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRetry {
    retries: u32,
    sleep: Duration,
}

impl ReadRetry {
    pub fn new(retries: u32, sleep: Duration) -> Self {
        Self { retries, sleep }
    }

    /// A policy that calls the operation exactly once.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Runs `operation`, retrying transient failures.
    ///
    /// Each transient failure consumes one retry and sleeps before the next
    /// attempt. Once the budget is spent a final attempt is made and its
    /// outcome is returned unchanged. Non-transient errors return immediately.
    pub async fn run<T, E, F, Fut>(&self, name: &str, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + Display,
    {
        let mut remaining = self.retries;
        while remaining > 0 {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => {
                    remaining -= 1;
                    warn!(
                        operation = name,
                        retries_left = remaining,
                        error = %err,
                        "Transient read failure, retrying"
                    );
                    tokio::time::sleep(self.sleep).await;
                }
                Err(err) => return Err(err),
            }
        }
        operation().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DatabaseError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> DatabaseError {
        DatabaseError::QueryFailed(sqlx::Error::PoolTimedOut)
    }

    #[tokio::test]
    async fn test_succeeds_after_two_transient_failures() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let retry = ReadRetry::new(2, Duration::from_millis(1));

        let result = retry
            .run("flaky_read", || async move {
                let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if call <= 2 {
                    Err(transient())
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_final_attempt_error_is_returned() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let retry = ReadRetry::new(2, Duration::from_millis(1));

        let result: Result<(), DatabaseError> = retry
            .run("always_busy", || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            })
            .await;

        assert!(matches!(
            result,
            Err(DatabaseError::QueryFailed(sqlx::Error::PoolTimedOut))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_transient_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let retry = ReadRetry::new(5, Duration::from_millis(1));

        let result: Result<(), DatabaseError> = retry
            .run("missing_row", || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(DatabaseError::NotFound("run 7".to_string()))
            })
            .await;

        assert!(matches!(result, Err(DatabaseError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_budget_calls_once() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), DatabaseError> = ReadRetry::none()
            .run("single", || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

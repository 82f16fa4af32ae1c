//! Retry policy for I/O boundary calls
//!
//! The policy is handed to each component at construction; components never
//! pick their own. The default makes exactly one attempt.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::Retryable;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 1;
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 1_000;
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;

/// Attempt budget and exponential backoff between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first (1 = no retry)
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles after each failure
    pub initial_backoff_ms: u64,
    /// Upper bound on a single delay
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    /// Single attempt, no backoff
    pub fn none() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
        }
    }

    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::none()
        }
    }

    /// Delay after the given failed attempt (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let millis = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent; the last error is returned
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < max_attempts && err.is_retryable() => {
                    let delay = self.backoff(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> StorageError {
        StorageError::Upload {
            location: "s3://b/k".to_string(),
            message: "reset".to_string(),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 500,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::with_attempts(3);

        let result: Result<u32, StorageError> = policy
            .run("upload", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(transient())
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_policy_makes_one_attempt() {
        let calls = AtomicU32::new(0);

        let result: Result<(), StorageError> = RetryPolicy::default()
            .run("upload", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::with_attempts(5);

        let result: Result<(), StorageError> = policy
            .run("download", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StorageError::NotFound {
                    location: "s3://b/missing.csv".to_string(),
                })
            })
            .await;

        assert!(matches!(result, Err(StorageError::NotFound { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

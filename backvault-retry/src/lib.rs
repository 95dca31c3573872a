//! Retry and backoff logic for Backvault network adapters
//!
//! Adapters wrap each remote call in [`with_retry`], classifying every failure as
//! transient (connection problems, timeouts, server errors) or permanent (client and
//! validation errors). Transient failures are retried with a quadratic delay
//! (`attempt² × unit`) until the policy's retry budget is spent; permanent failures
//! are returned immediately.

use backoff::backoff::Backoff;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Boxed error carried through the retry layer
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Common retry error types
#[derive(Error, Debug)]
pub enum RetryError {
    #[error("Operation '{operation}' failed after {attempts} attempts: {source}")]
    MaxRetriesExceeded {
        operation: &'static str,
        attempts: usize,
        source: BoxError,
    },
    #[error("Transient error in '{operation}': {source}")]
    Transient {
        operation: &'static str,
        source: BoxError,
    },
    #[error("Permanent error in '{operation}': {source}")]
    Permanent {
        operation: &'static str,
        source: BoxError,
    },
}

impl RetryError {
    /// Build a transient or permanent error depending on how `err` classifies itself
    pub fn classify<E>(operation: &'static str, err: E) -> Self
    where
        E: RetryableError + std::error::Error + Send + Sync + 'static,
    {
        if err.is_transient() {
            RetryError::Transient {
                operation,
                source: Box::new(err),
            }
        } else {
            RetryError::Permanent {
                operation,
                source: Box::new(err),
            }
        }
    }

    /// Name of the operation that failed
    pub fn operation(&self) -> &'static str {
        match self {
            RetryError::MaxRetriesExceeded { operation, .. }
            | RetryError::Transient { operation, .. }
            | RetryError::Permanent { operation, .. } => operation,
        }
    }

    /// True when the failure was a permanent one that was never retried
    pub fn is_permanent(&self) -> bool {
        matches!(self, RetryError::Permanent { .. })
    }

    /// Consume the error and hand back the underlying cause
    pub fn into_source(self) -> BoxError {
        match self {
            RetryError::MaxRetriesExceeded { source, .. }
            | RetryError::Transient { source, .. }
            | RetryError::Permanent { source, .. } => source,
        }
    }
}

/// Result type for retry operations
pub type RetryResult<T> = std::result::Result<T, RetryError>;

/// Retry budget and delay unit for a remote operation
///
/// A policy with `max_retries = 3` performs at most four attempts, sleeping
/// `1 × unit`, `4 × unit` and `9 × unit` between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    unit: Duration,
}

impl RetryPolicy {
    /// Create a policy with the given retry budget and a one second delay unit
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            unit: Duration::from_secs(1),
        }
    }

    /// Override the delay unit (tests use milliseconds or zero)
    pub fn with_unit(mut self, unit: Duration) -> Self {
        self.unit = unit;
        self
    }

    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self::new(0)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Total attempts this policy allows, including the first one
    pub fn max_attempts(&self) -> usize {
        self.max_retries as usize + 1
    }

    /// Delay slept before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.unit.saturating_mul(retry.saturating_mul(retry))
    }

    /// Fresh backoff schedule for one logical operation
    pub fn backoff(&self) -> QuadraticBackoff {
        QuadraticBackoff {
            policy: *self,
            retries: 0,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Quadratic backoff schedule: `unit`, `4 × unit`, `9 × unit`, ... until the budget is spent
#[derive(Debug, Clone)]
pub struct QuadraticBackoff {
    policy: RetryPolicy,
    retries: u32,
}

impl Backoff for QuadraticBackoff {
    fn reset(&mut self) {
        self.retries = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.retries >= self.policy.max_retries {
            return None;
        }
        self.retries += 1;
        Some(self.policy.delay_for(self.retries))
    }
}

/// Execute an operation with the default policy (three retries, one second unit)
pub async fn with_backoff<F, Fut, T>(op_name: &'static str, f: F) -> RetryResult<T>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = RetryResult<T>>,
{
    with_retry(op_name, &RetryPolicy::default(), f).await
}

/// Execute an operation under `policy`
///
/// The closure receives the 1-based attempt number. It must report failures as
/// [`RetryError::Transient`] or [`RetryError::Permanent`].
pub async fn with_retry<F, Fut, T>(
    op_name: &'static str,
    policy: &RetryPolicy,
    mut f: F,
) -> RetryResult<T>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = RetryResult<T>>,
{
    let mut schedule = policy.backoff();
    let mut attempt = 1;

    loop {
        debug!(operation = op_name, attempt, "Attempting operation");

        match f(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(
                        operation = op_name,
                        attempts = attempt,
                        "Operation succeeded after retrying"
                    );
                }
                return Ok(result);
            }
            Err(RetryError::Permanent { source, .. }) => {
                warn!(
                    operation = op_name,
                    attempt,
                    error = %source,
                    "Operation failed permanently"
                );
                return Err(RetryError::Permanent {
                    operation: op_name,
                    source,
                });
            }
            Err(err) => {
                let source = err.into_source();
                let Some(delay) = schedule.next_backoff() else {
                    warn!(
                        operation = op_name,
                        attempts = attempt,
                        error = %source,
                        "Retry budget exhausted"
                    );
                    return Err(RetryError::MaxRetriesExceeded {
                        operation: op_name,
                        attempts: attempt,
                        source,
                    });
                };

                warn!(
                    operation = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %source,
                    "Operation failed, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(feature = "async-rt")]
async fn sleep(delay: Duration) {
    tokio::time::sleep(delay).await;
}

#[cfg(not(feature = "async-rt"))]
async fn sleep(delay: Duration) {
    std::thread::sleep(delay);
}

/// Trait for categorizing errors as transient or permanent
pub trait RetryableError {
    /// Returns true if the error is transient and the operation should be retried
    fn is_transient(&self) -> bool;

    /// Returns true if the error is permanent and retries should stop
    fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

/// Helper macro for creating transient errors
#[macro_export]
macro_rules! transient_error {
    ($op:expr, $err:expr) => {
        $crate::RetryError::Transient {
            operation: $op,
            source: Box::new($err),
        }
    };
}

/// Helper macro for creating permanent errors
#[macro_export]
macro_rules! permanent_error {
    ($op:expr, $err:expr) => {
        $crate::RetryError::Permanent {
            operation: $op,
            source: Box::new($err),
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn refused() -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused")
    }

    #[tokio::test]
    async fn test_successful_operation() {
        let result = with_backoff("test_op", |_attempt| async { Ok("success") }).await;

        assert_eq!(result.unwrap(), "success");
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_then_success() {
        let attempt_count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempt_count);

        let result = with_backoff("test_op", move |_attempt| {
            let count = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if count < 2 {
                    Err(transient_error!("test_op", refused()))
                } else {
                    Ok("success")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let attempt_count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempt_count);

        let result: RetryResult<&str> = with_backoff("test_op", move |_attempt| {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                Err(permanent_error!(
                    "test_op",
                    std::io::Error::new(std::io::ErrorKind::PermissionDenied, "permission denied")
                ))
            }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Permanent { .. })));
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhausted_reports_attempts() {
        let policy = RetryPolicy::new(2);
        let result: RetryResult<()> = with_retry("upload", &policy, |_attempt| async {
            Err(transient_error!("upload", refused()))
        })
        .await;

        match result {
            Err(RetryError::MaxRetriesExceeded {
                operation, attempts, ..
            }) => {
                assert_eq!(operation, "upload");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected MaxRetriesExceeded, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_grows_quadratically() {
        let policy = RetryPolicy::new(3);
        let start = tokio::time::Instant::now();

        let _: RetryResult<()> = with_retry("health_check", &policy, |_attempt| async {
            Err(transient_error!("health_check", refused()))
        })
        .await;

        // 1 + 4 + 9 seconds of virtual time
        assert_eq!(start.elapsed(), Duration::from_secs(14));
    }

    #[test]
    fn test_quadratic_schedule() {
        let policy = RetryPolicy::new(3).with_unit(Duration::from_millis(10));
        let mut schedule = policy.backoff();

        assert_eq!(schedule.next_backoff(), Some(Duration::from_millis(10)));
        assert_eq!(schedule.next_backoff(), Some(Duration::from_millis(40)));
        assert_eq!(schedule.next_backoff(), Some(Duration::from_millis(90)));
        assert_eq!(schedule.next_backoff(), None);

        schedule.reset();
        assert_eq!(schedule.next_backoff(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn test_no_retry_policy() {
        let policy = RetryPolicy::no_retry();
        assert_eq!(policy.max_attempts(), 1);
        assert_eq!(policy.backoff().next_backoff(), None);
    }

    #[derive(Debug, Error)]
    #[error("flaky: {0}")]
    struct Flaky(bool);

    impl RetryableError for Flaky {
        fn is_transient(&self) -> bool {
            self.0
        }
    }

    #[test]
    fn test_classify_uses_retryable_error() {
        assert!(!RetryError::classify("op", Flaky(true)).is_permanent());
        assert!(RetryError::classify("op", Flaky(false)).is_permanent());
    }
}

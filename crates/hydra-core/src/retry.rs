//! Explicit retry policies for activity execution.
//!
//! Mirrors the shape of a workflow-runtime retry policy: bounded attempts,
//! exponential backoff, and a non-retryable error predicate supplied by the
//! caller.

use std::future::Future;
use std::time::Duration;

/// Bounded exponential-backoff retry policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub maximum_attempts: u32,
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
}

impl RetryPolicy {
    pub fn new(maximum_attempts: u32, initial_interval: Duration, backoff_coefficient: f64) -> Self {
        Self {
            maximum_attempts,
            initial_interval,
            backoff_coefficient,
        }
    }

    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, 1.0)
    }

    /// Backoff before retrying after the given 1-based failed attempt.
    fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self.backoff_coefficient.powi(attempt.saturating_sub(1) as i32);
        self.initial_interval.mul_f64(factor)
    }
}

/// Run `op` under `policy`, retrying on errors for which `is_retryable`
/// returns true. The operation receives the 1-based attempt number.
///
/// The final error is returned once attempts are exhausted or a
/// non-retryable error is seen.
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    is_retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= policy.maximum_attempts.max(1) || !is_retryable(&err) {
                    return Err(err);
                }
                tokio::time::sleep(policy.delay_after(attempt)).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    enum TestError {
        Transient,
        Fatal,
    }

    #[tokio::test]
    async fn succeeds_first_try_without_sleeping() {
        let policy = RetryPolicy::new(3, Duration::from_secs(60), 2.0);
        let result: Result<u32, TestError> = with_retry(&policy, |_| true, |_| async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), 2.0);
        let calls = AtomicU32::new(0);

        let result = with_retry(
            &policy,
            |e| *e == TestError::Transient,
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(TestError::Transient)
                    } else {
                        Ok(attempt)
                    }
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_fails_immediately() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1), 2.0);
        let calls = AtomicU32::new(0);

        let result: Result<(), TestError> = with_retry(
            &policy,
            |e| *e == TestError::Transient,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::Fatal) }
            },
        )
        .await;

        assert_eq!(result.unwrap_err(), TestError::Fatal);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_attempts_return_last_error() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1), 2.0);
        let calls = AtomicU32::new(0);

        let result: Result<(), TestError> = with_retry(
            &policy,
            |_| true,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::Transient) }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn backoff_grows_exponentially() {
        let policy = RetryPolicy::new(4, Duration::from_secs(10), 2.0);
        assert_eq!(policy.delay_after(1), Duration::from_secs(10));
        assert_eq!(policy.delay_after(2), Duration::from_secs(20));
        assert_eq!(policy.delay_after(3), Duration::from_secs(40));
    }
}

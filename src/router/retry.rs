//! Bounded retry with exponential backoff and a per-attempt timeout.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::config::RetryConfig;

/// Backoff schedule derived from [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig, attempt_timeout: Duration) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: Duration::from_millis(config.initial_backoff_ms),
            max_delay: Duration::from_millis(config.max_backoff_ms),
            factor: config.factor,
            attempt_timeout,
        }
    }

    /// Delay before attempt `attempt + 1` (attempts count from 1), capped at
    /// `max_delay`. Overflowing or non-finite growth saturates at the cap.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let growth = self.factor.max(1.0).powi(exp);
        let nanos = (self.initial_delay.as_nanos() as f64 * growth).round();
        if nanos.is_finite() && nanos < self.max_delay.as_nanos() as f64 {
            Duration::from_nanos(nanos as u64)
        } else {
            self.max_delay
        }
    }
}

/// Why a retried operation gave up.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryFailure<E> {
    /// The last attempt returned an error.
    Failed { attempts: u32, last: E },
    /// The last attempt ran out of time.
    TimedOut { attempts: u32 },
}

/// Run `operation` until it succeeds or the policy is exhausted.
///
/// `on_retry` runs before every attempt after the first.
pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    policy: &RetryPolicy,
    mut on_retry: impl FnMut(u32),
    mut operation: F,
) -> Result<T, RetryFailure<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        let failure = match timeout(policy.attempt_timeout, operation()).await {
            Ok(Ok(value)) => {
                if attempt > 1 {
                    info!(operation = operation_name, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Ok(Err(err)) => {
                warn!(
                    operation = operation_name,
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %err,
                    "Attempt failed"
                );
                RetryFailure::Failed { attempts: attempt, last: err }
            }
            Err(_) => {
                warn!(
                    operation = operation_name,
                    attempt,
                    max_attempts = policy.max_attempts,
                    timeout_ms = policy.attempt_timeout.as_millis() as u64,
                    "Attempt timed out"
                );
                RetryFailure::TimedOut { attempts: attempt }
            }
        };

        if attempt >= policy.max_attempts {
            return Err(failure);
        }
        sleep(policy.delay_after(attempt)).await;
        attempt += 1;
        on_retry(attempt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
            attempt_timeout: Duration::from_millis(50),
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let p = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
            ..policy()
        };
        assert_eq!(p.delay_after(1), Duration::from_millis(100));
        assert_eq!(p.delay_after(2), Duration::from_millis(200));
        assert_eq!(p.delay_after(3), Duration::from_millis(250));
    }

    #[test]
    fn test_huge_factor_saturates_at_cap() {
        for factor in [1e300, f64::INFINITY, f64::NAN] {
            let p = RetryPolicy { factor, ..policy() };
            for attempt in 1..=3 {
                assert!(p.delay_after(attempt) <= p.max_delay);
            }
        }
        let p = RetryPolicy { factor: 1e300, ..policy() };
        assert_eq!(p.delay_after(2), p.max_delay);
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let mut retries = 0;
        let operation = || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(format!("fail {n}"))
                } else {
                    Ok(n)
                }
            }
        };
        let result: Result<u32, RetryFailure<String>> =
            retry("op", &policy(), |_| retries += 1, operation).await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), RetryFailure<String>> = retry("op", &policy(), |_| {}, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("down".to_string()) }
        })
        .await;
        assert_eq!(
            result.unwrap_err(),
            RetryFailure::Failed {
                attempts: 3,
                last: "down".to_string()
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_attempt() {
        let result: Result<(), RetryFailure<String>> = retry("op", &policy(), |_| {}, || async {
            sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_eq!(result.unwrap_err(), RetryFailure::TimedOut { attempts: 3 });
    }
}

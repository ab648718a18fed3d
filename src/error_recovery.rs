//! Retry policies for instrument I/O.
//!
//! Bench instruments on GPIB occasionally miss a read or time out while a
//! previous command is still executing. Every write and query therefore goes
//! through [`retry_with`], which repeats transport-level failures a fixed number
//! of times before giving up with [`CalError::Timeout`].

use crate::error::{AppResult, CalError};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Boxed future returned by a single retry attempt.
pub type AttemptFuture<'a, R> = Pin<Box<dyn Future<Output = AppResult<R>> + Send + 'a>>;

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// The delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// A policy that never waits between attempts. Used by simulated sessions.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff_delay: Duration::ZERO,
        }
    }
}

/// Runs `op` against `target` until it succeeds, fails with a non-retryable
/// error, or `policy.max_attempts` is reached.
///
/// Each attempt gets a fresh mutable borrow of `target`, so the closure must
/// own everything else it needs (clone command strings before moving them in).
///
/// ```
/// use scope_cal::error::CalError;
/// use scope_cal::error_recovery::{retry_with, RetryPolicy};
///
/// # tokio_test::block_on(async {
/// let mut misses = 2u32;
/// let reply = retry_with(&RetryPolicy::immediate(3), "poll", &mut misses, |m| {
///     Box::pin(async move {
///         if *m > 0 {
///             *m -= 1;
///             Err(CalError::transport("GPIB0::22::INSTR", "VI_ERROR_TMO"))
///         } else {
///             Ok("+1.0E+00")
///         }
///     })
/// })
/// .await;
/// assert_eq!(reply.unwrap(), "+1.0E+00");
/// # });
/// ```
pub async fn retry_with<T, R, F>(
    policy: &RetryPolicy,
    label: &str,
    target: &mut T,
    mut op: F,
) -> AppResult<R>
where
    T: ?Sized,
    F: for<'a> FnMut(&'a mut T) -> AttemptFuture<'a, R>,
{
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        match op(target).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() => {
                warn!(attempt, max = attempts, "{} failed: {}", label, err);
                if attempt < attempts && !policy.backoff_delay.is_zero() {
                    sleep(policy.backoff_delay).await;
                }
            }
            Err(err) => return Err(err),
        }
    }
    Err(CalError::Timeout {
        operation: label.to_string(),
        attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    struct Flaky {
        calls: u32,
        succeed_on: u32,
    }

    impl Flaky {
        async fn poke(&mut self) -> AppResult<u32> {
            self.calls += 1;
            if self.calls >= self.succeed_on {
                Ok(self.calls)
            } else {
                Err(CalError::transport("SIM", "VI_ERROR_TMO"))
            }
        }
    }

    #[tokio::test]
    async fn test_retry_logic_succeeds() {
        let mut flaky = Flaky {
            calls: 0,
            succeed_on: 2,
        };
        let policy = RetryPolicy::immediate(3);
        let result = retry_with(&policy, "poke", &mut flaky, |f| Box::pin(f.poke())).await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(flaky.calls, 2);
    }

    #[tokio::test]
    async fn test_retry_logic_fails() {
        let mut flaky = Flaky {
            calls: 0,
            succeed_on: 4,
        };
        let policy = RetryPolicy::immediate(3);
        let result = retry_with(&policy, "poke", &mut flaky, |f| Box::pin(f.poke())).await;
        match result {
            Err(CalError::Timeout { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(flaky.calls, 3);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_each_retry_is_logged() {
        let mut flaky = Flaky {
            calls: 0,
            succeed_on: 3,
        };
        let policy = RetryPolicy::immediate(3);
        let result = retry_with(&policy, "poke", &mut flaky, |f| Box::pin(f.poke())).await;
        assert_eq!(result.unwrap(), 3);
        assert!(logs_contain("poke failed"));
        assert!(logs_contain("attempt=2"));
        assert!(!logs_contain("attempt=3"));
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let mut calls = 0u32;
        let policy = RetryPolicy::immediate(3);
        let result: AppResult<()> = retry_with(&policy, "bad", &mut calls, |c| {
            Box::pin(async move {
                *c += 1;
                Err(CalError::InvalidArgument("nope".into()))
            })
        })
        .await;
        assert!(matches!(result, Err(CalError::InvalidArgument(_))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_default_policy_matches_driver_retries() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff_delay, Duration::from_secs(1));
    }
}

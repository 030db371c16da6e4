//! Retry and backoff policy shared by the decision broker, the remediation
//! executor, and every durable-store write.
//!
//! Call sites never hand-roll loops: they hand a closure to
//! [`RetryPolicy::run`] and let the error type decide, via [`Transience`],
//! whether another attempt is allowed.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Classifies an error as worth retrying or not.
pub trait Transience {
    fn is_transient(&self) -> bool;
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero is treated as one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff_ms: u64,
    /// Growth factor applied per retry.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub max_backoff_ms: u64,
    /// Add up to 20% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            multiplier: 2.0,
            max_backoff_ms: 30_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// A policy with `max_attempts` tries and no sleeping in between.
    /// Mostly useful in tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: 0,
            multiplier: 1.0,
            max_backoff_ms: 0,
            jitter: false,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let base = self.initial_backoff_ms as f64 * self.multiplier.max(1.0).powi(exp);
        let capped = base.min(self.max_backoff_ms as f64).max(0.0);
        let with_jitter = if self.jitter && capped > 0.0 {
            capped * (1.0 + rand::thread_rng().gen_range(0.0..0.2))
        } else {
            capped
        };
        Duration::from_millis(with_jitter.round() as u64)
    }

    /// Run `op` until it succeeds, fails with a non-transient error, the
    /// attempt budget is spent, or `cancel` fires while waiting between
    /// attempts. The last error is returned in every failure case.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T, E>
    where
        E: Transience + std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let budget = self.attempts();
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() || attempt >= budget => return Err(e),
                Err(e) => {
                    let delay = self.backoff(attempt);
                    debug!(attempt, budget, delay_ms = delay.as_millis() as u64, error = %e, "transient failure, backing off");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(e),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct Flaky(bool);

    impl std::fmt::Display for Flaky {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "flaky(transient={})", self.0)
        }
    }

    impl Transience for Flaky {
        fn is_transient(&self) -> bool {
            self.0
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff_ms: 100,
            multiplier: 2.0,
            max_backoff_ms: 300,
            jitter: false,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(300));
        assert_eq!(policy.backoff(10), Duration::from_millis(300));
    }

    #[test]
    fn test_zero_attempts_means_one() {
        let policy = RetryPolicy::immediate(0);
        assert_eq!(policy.attempts(), 1);
    }

    #[tokio::test]
    async fn test_transient_errors_retried_up_to_budget() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::immediate(3);
        let result: Result<(), Flaky> = policy
            .run(&CancellationToken::new(), |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Flaky(true))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_transient_error_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::immediate(5);
        let result: Result<(), Flaky> = policy
            .run(&CancellationToken::new(), |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Flaky(false))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_success_after_transient_failure() {
        let policy = RetryPolicy::immediate(3);
        let result: Result<u32, Flaky> = policy
            .run(&CancellationToken::new(), |attempt| async move {
                if attempt < 2 {
                    Err(Flaky(true))
                } else {
                    Ok(attempt)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_cancel_stops_backoff() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff_ms: 60_000,
            multiplier: 1.0,
            max_backoff_ms: 60_000,
            jitter: false,
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), Flaky> = policy
            .run(&cancel, |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Flaky(true))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

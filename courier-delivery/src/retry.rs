//! Retry policy for a single provider call.
//!
//! Runs an operation up to `max_attempts` times with exponential backoff between
//! attempts. The policy holds configuration only; it keeps no record of past calls.

use std::{future::Future, time::Duration};

use courier_common::tracing;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{ConfigError, DeliveryError};

/// Retry policy configuration for provider calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts per provider sequence, including the first.
    ///
    /// Default: 3 attempts
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,

    /// Base delay for exponential backoff (in milliseconds).
    ///
    /// The delay after failed attempt `k` (0-indexed) is `base * 2^k`.
    ///
    /// Default: 500 milliseconds
    #[serde(default = "defaults::base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum delay between attempts (in milliseconds).
    ///
    /// Default: 30000 milliseconds
    #[serde(default = "defaults::max_delay_ms")]
    pub max_delay_ms: u64,

    /// Jitter factor for randomizing delays.
    ///
    /// The delay is randomized within ±`jitter_factor`. Zero disables jitter.
    ///
    /// Default: 0.0
    #[serde(default = "defaults::jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::max_attempts(),
            base_delay_ms: defaults::base_delay_ms(),
            max_delay_ms: defaults::max_delay_ms(),
            jitter_factor: defaults::jitter_factor(),
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if `attempt` (0-indexed) is the last one the policy allows.
    #[must_use]
    pub const fn is_final_attempt(&self, attempt: u32) -> bool {
        attempt + 1 >= self.max_attempts
    }

    /// Delay to wait after failed attempt `attempt` (0-indexed).
    ///
    /// # Formula
    /// `delay = min(base * 2^attempt, max_delay) * (1 ± jitter)`
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = if attempt >= 63 {
            self.max_delay_ms
        } else {
            self.base_delay_ms
                .saturating_mul(1u64 << attempt)
                .min(self.max_delay_ms)
        };

        if self.jitter_factor <= 0.0 {
            return Duration::from_millis(delay);
        }

        // Intentional precision loss and casting for randomization
        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let jittered = {
            let jitter_range = (delay as f64) * self.jitter_factor;
            let jitter: f64 = rand::rng().random_range(-jitter_range..=jitter_range);
            ((delay as f64) + jitter).max(0.0) as u64
        };

        Duration::from_millis(jittered)
    }

    /// Run `operation` until it succeeds or the attempt budget is spent.
    ///
    /// `operation` receives the 0-indexed attempt number. Permanent failures end
    /// the sequence straight away. The backoff sleep is abandoned if `cancel`
    /// fires.
    ///
    /// # Errors
    ///
    /// Returns the last attempt's error, or [`DeliveryError::Cancelled`].
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, DeliveryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, DeliveryError>>,
    {
        let mut attempt = 0;

        loop {
            let err = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if self.is_final_attempt(attempt) || !err.is_retryable() {
                return Err(err);
            }

            let delay = self.delay_for(attempt);
            tracing::debug!(
                attempt = attempt + 1,
                max_attempts = self.max_attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "Attempt failed, backing off"
            );

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => return Err(DeliveryError::Cancelled),
            }

            attempt += 1;
        }
    }

    /// # Errors
    ///
    /// Returns an error if the policy would never attempt anything, or the jitter
    /// factor is outside `0.0..=1.0`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "retry.max_attempts",
                reason: "must be at least 1".to_string(),
            });
        }

        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::Invalid {
                field: "retry.jitter_factor",
                reason: format!("{} is outside 0.0..=1.0", self.jitter_factor),
            });
        }

        Ok(())
    }
}

mod defaults {
    pub const fn max_attempts() -> u32 {
        3
    }

    pub const fn base_delay_ms() -> u64 {
        500
    }

    pub const fn max_delay_ms() -> u64 {
        30_000
    }

    pub const fn jitter_factor() -> f64 {
        0.0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicU32, Ordering},
    };

    use tokio::time::Instant;

    use super::*;
    use crate::error::ProviderError;

    fn policy(max_attempts: u32, base_delay_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn test_retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay_ms, 500);
        assert_eq!(policy.max_delay_ms, 30_000);
        assert!(policy.jitter_factor.abs() < f64::EPSILON);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_is_final_attempt() {
        let policy = RetryPolicy::default();

        assert!(!policy.is_final_attempt(0));
        assert!(!policy.is_final_attempt(1));
        assert!(policy.is_final_attempt(2));
        assert!(policy.is_final_attempt(3));
    }

    #[test]
    fn test_exponential_delays() {
        let policy = RetryPolicy {
            max_delay_ms: 3000,
            ..RetryPolicy::default()
        };

        assert_eq!(policy.delay_for(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
        // Capped
        assert_eq!(policy.delay_for(3), Duration::from_millis(3000));
        assert_eq!(policy.delay_for(80), Duration::from_millis(3000));
    }

    #[test]
    fn test_delay_with_jitter_stays_in_range() {
        let policy = RetryPolicy {
            jitter_factor: 0.2,
            ..RetryPolicy::default()
        };

        for _ in 0..50 {
            let delay = policy.delay_for(1).as_millis();
            assert!((800..=1200).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(policy(0, 500).validate().is_err());

        let policy = RetryPolicy {
            jitter_factor: 1.5,
            ..RetryPolicy::default()
        };
        assert!(policy.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_invokes_exactly_max_attempts() {
        let policy = policy(3, 500);
        let calls = Mutex::new(Vec::new());
        let start = Instant::now();

        let result: Result<(), _> = policy
            .run(&CancellationToken::new(), |attempt| {
                calls.lock().unwrap().push((attempt, start.elapsed()));
                async { Err(ProviderError::Temporary("down".to_string()).into()) }
            })
            .await;

        assert!(result.unwrap_err().is_retryable());

        let calls = calls.into_inner().unwrap();
        let attempts: Vec<u32> = calls.iter().map(|(attempt, _)| *attempt).collect();
        assert_eq!(attempts, vec![0, 1, 2]);

        // Delays of base, then 2 * base between attempts
        let first_gap = calls[1].1 - calls[0].1;
        let second_gap = calls[2].1 - calls[1].1;
        assert!(first_gap >= Duration::from_millis(500) && first_gap < Duration::from_millis(550));
        assert!(second_gap >= Duration::from_millis(1000) && second_gap < Duration::from_millis(1050));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_stops_retrying() {
        let policy = policy(5, 10);
        let calls = AtomicU32::new(0);

        let result = policy
            .run(&CancellationToken::new(), |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 1 {
                        Err(ProviderError::Temporary("blip".to_string()).into())
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let policy = policy(3, 10);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = policy
            .run(&CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::Permanent("rejected".to_string()).into()) }
            })
            .await;

        assert!(result.unwrap_err().is_permanent());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let policy = policy(3, 60_000);
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                cancel.cancel();
            })
        };

        let result: Result<(), _> = policy
            .run(&cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::Temporary("down".to_string()).into()) }
            })
            .await;

        canceller.await.unwrap();
        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

//! Global rate limiting using a fully refilling token bucket
//!
//! One limiter gates every dispatch attempt across all providers and messages.
//!
//! # Token Bucket Algorithm
//!
//! - The bucket starts with `capacity` tokens
//! - Each dispatch attempt consumes one token
//! - If no tokens are available, the caller is queued (FIFO)
//! - Every `interval` a background task resets the bucket to `capacity` and
//!   hands tokens to queued callers in arrival order until either runs out
//!
//! # Example
//!
//! ```text
//! Rate limit: capacity 5, interval 1s, 12 callers arriving at t=0
//! - t=0s: callers 1-5 granted immediately, 6-12 queued
//! - t=1s: refill, callers 6-10 granted
//! - t=2s: refill, callers 11-12 granted, 3 tokens left over
//! ```

use std::{collections::VecDeque, sync::Arc, time::Duration};

use courier_common::{internal, tracing};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{sync::oneshot, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::{ConfigError, DeliveryError};

/// Configuration for the global rate limiter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Tokens available per interval
    #[serde(default = "default_capacity")]
    pub capacity: u32,

    /// Refill interval (milliseconds)
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            interval_ms: default_interval_ms(),
        }
    }
}

const fn default_capacity() -> u32 {
    5 // 5 dispatches ...
}

const fn default_interval_ms() -> u64 {
    1000 // ... per second
}

impl RateLimitConfig {
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// # Errors
    ///
    /// Returns an error if the capacity or interval is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "rate_limit.capacity",
                reason: "must be greater than zero".to_string(),
            });
        }

        if self.interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "rate_limit.interval_ms",
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(())
    }
}

/// Token pool shared between callers and the refill task
#[derive(Debug)]
struct TokenBucket {
    /// Tokens left in the current interval
    tokens: u32,
    /// Tokens granted per interval
    capacity: u32,
    /// Callers waiting for a token, oldest first
    waiters: VecDeque<oneshot::Sender<()>>,
}

impl TokenBucket {
    const fn new(capacity: u32) -> Self {
        Self {
            tokens: capacity,
            capacity,
            waiters: VecDeque::new(),
        }
    }

    /// Try to consume one token, returns true if successful
    ///
    /// Never jumps the queue: if anyone is already waiting the caller must wait too.
    fn try_consume(&mut self) -> bool {
        if self.tokens > 0 && self.waiters.is_empty() {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Reset to full capacity and serve the queue
    ///
    /// Returns the number of queued callers that were granted a token.
    fn refill(&mut self) -> usize {
        self.tokens = self.capacity;
        self.grant_waiters()
    }

    /// Return a token that was granted but never used
    fn restore(&mut self) {
        self.tokens = (self.tokens + 1).min(self.capacity);
        self.grant_waiters();
    }

    fn grant_waiters(&mut self) -> usize {
        let mut granted = 0;

        while self.tokens > 0 {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };

            // A closed receiver belongs to a caller that gave up; it does not get a token
            if waiter.send(()).is_ok() {
                self.tokens -= 1;
                granted += 1;
            }
        }

        granted
    }
}

/// Statistics for the rate limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStats {
    /// Tokens left in the current interval
    pub available_tokens: u32,
    /// Tokens granted per interval
    pub capacity: u32,
    /// Callers waiting for the next refill, not counting ones that gave up
    pub queued: usize,
}

/// Global rate limiter
///
/// Owns a background refill task which is stopped by [`RateLimiter::shutdown`]
/// or when the limiter is dropped.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Arc<Mutex<TokenBucket>>,
    interval: Duration,
    refill: CancellationToken,
}

impl RateLimiter {
    /// Create a rate limiter and start its refill task
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: &RateLimitConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let bucket = Arc::new(Mutex::new(TokenBucket::new(config.capacity)));
        let interval = config.interval();
        let refill = CancellationToken::new();

        tokio::spawn(refill_task(
            Arc::clone(&bucket),
            interval,
            refill.clone(),
        ));

        internal!(
            "Rate limiter started with capacity={} interval={}ms",
            config.capacity,
            config.interval_ms
        );

        Ok(Self {
            bucket,
            interval,
            refill,
        })
    }

    /// Wait for a dispatch token
    ///
    /// Resolves immediately while tokens remain, otherwise queues the caller
    /// until a refill reaches it.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Cancelled`] if `cancel` fires while waiting, or if
    /// the limiter is shut down before a token is granted.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), DeliveryError> {
        let receiver = {
            let mut bucket = self.bucket.lock();
            if bucket.try_consume() {
                return Ok(());
            }

            if self.refill.is_cancelled() {
                return Err(DeliveryError::Cancelled);
            }

            let (sender, receiver) = oneshot::channel();
            bucket.waiters.push_back(sender);

            tracing::debug!(
                queued = bucket.waiters.len(),
                wait_ms = u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX),
                "Rate limit exhausted, waiting for refill"
            );

            receiver
        };

        let mut waiter = Waiter {
            bucket: &self.bucket,
            receiver,
            consumed: false,
        };

        tokio::select! {
            biased;

            granted = &mut waiter.receiver => {
                granted.map_err(|_| DeliveryError::Cancelled)?;
                waiter.consumed = true;
                Ok(())
            }
            () = cancel.cancelled() => Err(DeliveryError::Cancelled),
        }
    }

    /// Current stats (for monitoring/debugging)
    pub fn stats(&self) -> RateLimitStats {
        let bucket = self.bucket.lock();

        RateLimitStats {
            available_tokens: bucket.tokens,
            capacity: bucket.capacity,
            queued: bucket
                .waiters
                .iter()
                .filter(|waiter| !waiter.is_closed())
                .count(),
        }
    }

    /// Stop the refill task
    ///
    /// Queued callers are released with [`DeliveryError::Cancelled`]; tokens left in
    /// the current interval can still be consumed.
    pub fn shutdown(&self) {
        if self.refill.is_cancelled() {
            return;
        }

        self.refill.cancel();
        self.bucket.lock().waiters.clear();
        internal!("Rate limiter shut down");
    }

    /// Whether the refill task is still scheduled
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.refill.is_cancelled()
    }
}

/// A queued `acquire` call
///
/// If the caller stops waiting, whether through its cancellation token or by
/// dropping the future, a token granted in the meantime goes back to the bucket.
struct Waiter<'a> {
    bucket: &'a Mutex<TokenBucket>,
    receiver: oneshot::Receiver<()>,
    consumed: bool,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if self.consumed {
            return;
        }

        self.receiver.close();
        if self.receiver.try_recv().is_ok() {
            self.bucket.lock().restore();
        }
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn refill_task(
    bucket: Arc<Mutex<TokenBucket>>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // The first tick completes immediately, and the bucket already starts full
    timer.tick().await;

    loop {
        tokio::select! {
            _ = timer.tick() => {
                let granted = bucket.lock().refill();
                if granted > 0 {
                    internal!("Rate limiter refilled, granted {} queued callers", granted);
                }
            }
            () = shutdown.cancelled() => break,
        }
    }

    bucket.lock().waiters.clear();
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn config(capacity: u32, interval_ms: u64) -> RateLimitConfig {
        RateLimitConfig {
            capacity,
            interval_ms,
        }
    }

    #[test]
    fn test_token_bucket_consume() {
        let mut bucket = TokenBucket::new(3);

        assert!(bucket.try_consume());
        assert!(bucket.try_consume());
        assert!(bucket.try_consume());

        // Should fail when empty
        assert!(!bucket.try_consume());
        assert_eq!(bucket.tokens, 0);
    }

    #[test]
    fn test_token_bucket_refill_serves_queue_in_order() {
        let mut bucket = TokenBucket::new(2);
        bucket.tokens = 0;

        let (first, mut first_rx) = oneshot::channel();
        let (second, mut second_rx) = oneshot::channel();
        let (third, mut third_rx) = oneshot::channel();
        bucket.waiters.extend([first, second, third]);

        assert_eq!(bucket.refill(), 2);
        assert!(first_rx.try_recv().is_ok());
        assert!(second_rx.try_recv().is_ok());
        assert!(third_rx.try_recv().is_err());
        assert_eq!(bucket.tokens, 0);
        assert_eq!(bucket.waiters.len(), 1);
    }

    #[test]
    fn test_token_bucket_skips_abandoned_waiters() {
        let mut bucket = TokenBucket::new(1);
        bucket.tokens = 0;

        let (abandoned, abandoned_rx) = oneshot::channel();
        let (waiting, mut waiting_rx) = oneshot::channel();
        bucket.waiters.extend([abandoned, waiting]);
        drop(abandoned_rx);

        assert_eq!(bucket.refill(), 1);
        assert!(waiting_rx.try_recv().is_ok());
        assert!(bucket.waiters.is_empty());
    }

    #[test]
    fn test_token_bucket_does_not_jump_queue() {
        let mut bucket = TokenBucket::new(1);
        let (waiter, _rx) = oneshot::channel();
        bucket.waiters.push_back(waiter);

        assert!(!bucket.try_consume());
    }

    #[test]
    fn test_config_validation() {
        assert!(RateLimitConfig::default().validate().is_ok());
        assert!(config(0, 1000).validate().is_err());
        assert!(config(5, 0).validate().is_err());
    }

    #[tokio::test]
    async fn test_acquire_within_capacity_is_immediate() {
        let limiter = RateLimiter::new(&config(3, 60_000)).unwrap();
        let cancel = CancellationToken::new();

        for _ in 0..3 {
            limiter.acquire(&cancel).await.unwrap();
        }

        let stats = limiter.stats();
        assert_eq!(stats.available_tokens, 0);
        assert_eq!(stats.capacity, 3);
        assert_eq!(stats.queued, 0);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_refill() {
        let limiter = RateLimiter::new(&config(1, 100)).unwrap();
        let cancel = CancellationToken::new();

        limiter.acquire(&cancel).await.unwrap();

        let started = tokio::time::Instant::now();
        limiter.acquire(&cancel).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_consume_token() {
        let limiter = Arc::new(RateLimiter::new(&config(1, 200)).unwrap());
        let cancel = CancellationToken::new();

        limiter.acquire(&cancel).await.unwrap();

        let waiter = {
            let limiter = Arc::clone(&limiter);
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(limiter.stats().queued, 1);

        cancel.cancel();
        assert!(waiter.await.unwrap().unwrap_err().is_cancelled());
        assert_eq!(limiter.stats().queued, 0);

        // After the next refill the token is still there for a fresh caller
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(limiter.stats().available_tokens, 1);
        limiter.acquire(&CancellationToken::new()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_waiter_returns_granted_token() {
        let limiter = RateLimiter::new(&config(1, 1000)).unwrap();
        let cancel = CancellationToken::new();
        limiter.acquire(&cancel).await.unwrap();

        let mut pending = Box::pin(limiter.acquire(&cancel));
        assert!(
            tokio::time::timeout(Duration::from_millis(1), &mut pending)
                .await
                .is_err()
        );
        assert_eq!(limiter.stats().queued, 1);

        // The refill hands the token to the queued call, which is then abandoned
        tokio::time::sleep(Duration::from_millis(1001)).await;
        drop(pending);

        assert_eq!(limiter.stats().available_tokens, 1);
        tokio::time::timeout(Duration::from_millis(10), limiter.acquire(&cancel))
            .await
            .expect("token available within the same interval")
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiters() {
        let limiter = Arc::new(RateLimiter::new(&config(1, 60_000)).unwrap());
        let cancel = CancellationToken::new();
        limiter.acquire(&cancel).await.unwrap();

        let waiter = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.acquire(&CancellationToken::new()).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        limiter.shutdown();

        assert!(!limiter.is_running());
        assert!(waiter.await.unwrap().unwrap_err().is_cancelled());
        assert!(limiter.acquire(&cancel).await.unwrap_err().is_cancelled());
    }
}

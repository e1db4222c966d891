//! Per-provider circuit breaker to isolate failing providers
//!
//! Every provider gets its own breaker. The breaker wraps a whole retry sequence,
//! so one exhausted sequence counts as a single failure.
//!
//! # Circuit Breaker Pattern
//!
//! The circuit breaker has three states:
//! - **Closed**: Normal operation, all calls pass through
//! - **Open**: Circuit tripped due to failures, calls are rejected without contacting the provider
//! - **Half-Open**: Testing recovery, a single probe call is let through
//!
//! # State Transitions
//!
//! ```text
//! ┌─────────┐  failures >= threshold   ┌──────┐
//! │ Closed  │ ───────────────────────> │ Open │ <──────────┐
//! └─────────┘                          └──────┘            │
//!     ^                                   │                │
//!     │                                   │ reset timeout  │
//!     │                                   v   elapsed      │
//!     │  Probe succeeds        ┌───────────────┐  Probe    │
//!     └────────────────────────│  Half-Open    │───────────┘
//!                              └───────────────┘  fails
//! ```
//!
//! # Example
//!
//! ```text
//! Threshold: 3 failures
//! Reset timeout: 10 seconds
//!
//! t=0s:   Closed (normal)
//! t=4s:   3rd consecutive failed sequence → Open
//! t=4s-14s: calls rejected immediately (no retries, no provider contact)
//! t=14s+: next call becomes the Half-Open probe
//! probe succeeds → Closed, failure count 0
//! ```

use std::{future::Future, sync::Arc, time::Duration};

use courier_common::{internal, tracing};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, DeliveryError};

/// Monotonic clock used for breaker timing
pub type Instant = std::time::Instant;

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failed sequences required to open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long the circuit stays open before a probe is allowed (milliseconds)
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,

    /// Per-provider overrides, keyed by provider name
    #[serde(default)]
    pub provider_overrides: ahash::AHashMap<String, ProviderCircuitBreakerConfig>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            provider_overrides: ahash::AHashMap::default(),
        }
    }
}

const fn default_failure_threshold() -> u32 {
    3
}

const fn default_reset_timeout_ms() -> u64 {
    10_000
}

/// Resolved breaker settings for one provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
}

impl ProviderCircuitBreakerConfig {
    #[must_use]
    pub const fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

impl CircuitBreakerConfig {
    /// Settings for `provider`, taking overrides into account
    #[must_use]
    pub fn for_provider(&self, provider: &str) -> ProviderCircuitBreakerConfig {
        self.provider_overrides.get(provider).copied().unwrap_or(
            ProviderCircuitBreakerConfig {
                failure_threshold: self.failure_threshold,
                reset_timeout_ms: self.reset_timeout_ms,
            },
        )
    }

    /// # Errors
    ///
    /// Returns an error if any failure threshold is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::Invalid {
                field: "circuit_breaker.failure_threshold",
                reason: "must be greater than zero".to_string(),
            });
        }

        if let Some((name, _)) = self
            .provider_overrides
            .iter()
            .find(|(_, config)| config.failure_threshold == 0)
        {
            return Err(ConfigError::Invalid {
                field: "circuit_breaker.provider_overrides",
                reason: format!("failure_threshold for {name} must be greater than zero"),
            });
        }

        Ok(())
    }
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation - all calls allowed
    Closed,
    /// Circuit tripped - reject all calls immediately
    Open,
    /// Testing recovery - a single probe call is in flight
    HalfOpen,
}

/// Outcome of asking the breaker whether a call may proceed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Allowed,
    Probe,
    Rejected,
}

/// Breaker state, only ever touched under the breaker's mutex
#[derive(Debug)]
struct CircuitBreakerData {
    /// Current state of the circuit
    state: CircuitState,
    /// Number of consecutive failed sequences
    failure_count: u32,
    /// When the circuit last (re)opened
    last_failure_at: Option<Instant>,
    /// Whether the Half-Open probe has been handed out
    probe_in_flight: bool,
    config: ProviderCircuitBreakerConfig,
}

impl CircuitBreakerData {
    const fn new(config: ProviderCircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_at: None,
            probe_in_flight: false,
            config,
        }
    }

    /// Strictly more than the reset timeout has passed since the circuit opened
    ///
    /// A clock reading earlier than `last_failure_at` counts as not yet elapsed.
    fn is_reset_timeout_elapsed(&self, now: Instant) -> bool {
        self.last_failure_at.is_some_and(|last_failure| {
            now.checked_duration_since(last_failure)
                .is_some_and(|elapsed| elapsed > self.config.reset_timeout())
        })
    }

    fn try_admit(&mut self, now: Instant, provider: &str) -> Admission {
        match self.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                if self.is_reset_timeout_elapsed(now) {
                    self.state = CircuitState::HalfOpen;
                    self.probe_in_flight = true;
                    tracing::info!(
                        provider = %provider,
                        "Circuit breaker entering HALF-OPEN state - testing recovery"
                    );
                    Admission::Probe
                } else {
                    Admission::Rejected
                }
            }
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    Admission::Rejected
                } else {
                    self.probe_in_flight = true;
                    Admission::Probe
                }
            }
        }
    }

    /// Record a successful sequence
    ///
    /// `admission` is how the reporting call was let through. While Half-Open only
    /// the probe decides the outcome.
    ///
    /// Returns `true` if circuit transitioned to Closed state (recovered)
    fn record_success(&mut self, admission: Admission, provider: &str) -> bool {
        let previous = self.state;

        if previous == CircuitState::HalfOpen && admission != Admission::Probe {
            return false;
        }

        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.last_failure_at = None;
        self.probe_in_flight = false;

        match previous {
            CircuitState::Closed => false,
            CircuitState::HalfOpen => {
                tracing::info!(
                    provider = %provider,
                    "Circuit breaker CLOSED - normal operation resumed"
                );
                true
            }
            CircuitState::Open => {
                // A call admitted before the circuit tripped came back healthy
                tracing::info!(
                    provider = %provider,
                    "Circuit breaker CLOSED by a late success"
                );
                true
            }
        }
    }

    /// Record a failed sequence
    ///
    /// Returns `true` if circuit transitioned to Open state (tripped)
    fn record_failure(&mut self, now: Instant, admission: Admission, provider: &str) -> bool {
        self.failure_count = self.failure_count.saturating_add(1);

        match self.state {
            CircuitState::Closed => {
                if self.failure_count >= self.config.failure_threshold {
                    self.state = CircuitState::Open;
                    self.last_failure_at = Some(now);
                    tracing::warn!(
                        provider = %provider,
                        failure_count = self.failure_count,
                        threshold = self.config.failure_threshold,
                        reset_timeout_ms = self.config.reset_timeout_ms,
                        "Circuit breaker OPENED - rejecting calls to protect failing provider"
                    );
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen if admission == Admission::Probe => {
                self.state = CircuitState::Open;
                self.last_failure_at = Some(now);
                self.probe_in_flight = false;
                tracing::warn!(
                    provider = %provider,
                    "Circuit breaker probe failed - reopening circuit"
                );
                true
            }
            // Admitted before the trip; the outstanding probe still decides
            CircuitState::HalfOpen => false,
            CircuitState::Open => {
                // Late failure from a call admitted before the trip keeps the circuit open longer
                self.last_failure_at = Some(now);
                false
            }
        }
    }

    /// Give back a probe that never produced an outcome
    fn release_probe(&mut self) {
        if self.state == CircuitState::HalfOpen && self.probe_in_flight {
            self.state = CircuitState::Open;
            self.probe_in_flight = false;
        }
    }
}

/// Circuit breaker for a single provider
#[derive(Debug)]
pub struct CircuitBreaker {
    provider: Arc<str>,
    data: Mutex<CircuitBreakerData>,
}

impl CircuitBreaker {
    /// Create a closed circuit breaker for `provider`
    #[must_use]
    pub fn new(provider: impl Into<Arc<str>>, config: ProviderCircuitBreakerConfig) -> Self {
        Self {
            provider: provider.into(),
            data: Mutex::new(CircuitBreakerData::new(config)),
        }
    }

    /// Name of the provider this breaker protects
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Run `operation` through the breaker
    ///
    /// While the circuit is open the operation is never invoked. Its outcome
    /// otherwise feeds the breaker, except for [`DeliveryError::Cancelled`] which
    /// says nothing about the provider's health.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::CircuitOpen`] if the call was short-circuited,
    /// or the operation's own error.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, DeliveryError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, DeliveryError>>,
    {
        let admission = self.data.lock().try_admit(Instant::now(), &self.provider);

        let mut probe = match admission {
            Admission::Rejected => {
                tracing::debug!(provider = %self.provider, "Circuit open, call short-circuited");
                return Err(DeliveryError::CircuitOpen {
                    provider: Arc::clone(&self.provider),
                });
            }
            Admission::Allowed => None,
            Admission::Probe => {
                internal!("Probing provider {}", self.provider);
                Some(ProbeGuard {
                    breaker: self,
                    armed: true,
                })
            }
        };

        let outcome = operation().await;

        let reported = match &outcome {
            Ok(_) => {
                self.data.lock().record_success(admission, &self.provider);
                true
            }
            Err(err) if err.counts_against_provider() => {
                self.data
                    .lock()
                    .record_failure(Instant::now(), admission, &self.provider);
                true
            }
            Err(_) => false,
        };

        // An unreported probe stays armed, so dropping the guard hands it back
        if reported && let Some(guard) = probe.as_mut() {
            guard.armed = false;
        }

        outcome
    }

    /// Get current circuit state
    pub fn state(&self) -> CircuitState {
        self.data.lock().state
    }

    /// Get statistics (for monitoring/debugging)
    pub fn stats(&self) -> CircuitBreakerStats {
        let data = self.data.lock();
        CircuitBreakerStats {
            state: data.state,
            failure_count: data.failure_count,
        }
    }
}

/// Hands the Half-Open probe back if the probing call never reports an outcome
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.data.lock().release_probe();
        }
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerStats {
    /// Current circuit state
    pub state: CircuitState,
    /// Number of consecutive failed sequences
    pub failure_count: u32,
}

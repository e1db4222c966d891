//! Orchestrator configuration

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::{
    circuit_breaker::CircuitBreakerConfig, error::ConfigError, rate_limiter::RateLimitConfig,
    retry::RetryPolicy,
};

const fn default_max_in_flight() -> usize {
    1024
}

const fn default_event_capacity() -> usize {
    256
}

/// Settings for a [`DeliveryOrchestrator`](crate::DeliveryOrchestrator)
///
/// Every field has a default, so an empty config section is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Global dispatch rate limit
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Circuit breaker settings, applied per provider
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Retry policy for each provider sequence
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Maximum number of `send` calls allowed past admission at once
    ///
    /// Further callers wait, which bounds how many can be queued on the rate limiter.
    ///
    /// Default: 1024
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// How many events a slow subscriber may lag behind before losing the oldest
    ///
    /// Default: 256
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryPolicy::default(),
            max_in_flight: default_max_in_flight(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl OrchestratorConfig {
    /// # Errors
    ///
    /// Returns the first invalid setting found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rate_limit.validate()?;
        self.circuit_breaker.validate()?;
        self.retry.validate()?;

        if self.max_in_flight == 0 || self.max_in_flight > Semaphore::MAX_PERMITS {
            return Err(ConfigError::Invalid {
                field: "max_in_flight",
                reason: format!("must be between 1 and {}", Semaphore::MAX_PERMITS),
            });
        }

        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "event_capacity",
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_settings() {
        let config = OrchestratorConfig::default();

        assert_eq!(config.rate_limit.capacity, 5);
        assert_eq!(config.rate_limit.interval_ms, 1000);
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.reset_timeout_ms, 10_000);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay_ms, 500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: OrchestratorConfig = ron::from_str("()").unwrap();
        assert_eq!(config, OrchestratorConfig::default());
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config_str = r#"(
            rate_limit: (capacity: 10),
            circuit_breaker: (
                failure_threshold: 5,
                provider_overrides: {
                    "ProviderB": (failure_threshold: 1, reset_timeout_ms: 500),
                },
            ),
            retry: (max_attempts: 4, jitter_factor: 0.1),
            max_in_flight: 64,
        )"#;

        let config: OrchestratorConfig = ron::from_str(config_str).unwrap();

        assert_eq!(config.rate_limit.capacity, 10);
        assert_eq!(config.rate_limit.interval_ms, 1000);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(
            config.circuit_breaker.for_provider("ProviderB").failure_threshold,
            1
        );
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.retry.base_delay_ms, 500);
        assert_eq!(config.max_in_flight, 64);
        assert_eq!(config.event_capacity, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_bounds() {
        let config = OrchestratorConfig {
            max_in_flight: 0,
            ..OrchestratorConfig::default()
        };
        assert!(config.validate().is_err());

        let config = OrchestratorConfig {
            event_capacity: 0,
            ..OrchestratorConfig::default()
        };
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config.rate_limit.capacity = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "rate_limit.capacity",
                ..
            })
        ));
    }
}

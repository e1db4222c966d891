//! Typed error handling for delivery operations.
//!
//! This module provides structured error types that distinguish between:
//! - Provider failures, temporary (retry with backoff) or permanent (fail over at once)
//! - Short-circuited calls against a provider whose breaker is open
//! - The aggregate failure once every provider has been exhausted
//! - Cancellation and configuration problems

use std::{
    fmt::{self, Display, Formatter},
    sync::Arc,
};

use courier_common::MessageId;
use serde::Serialize;
use thiserror::Error;

/// Top-level delivery error type.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// A single provider call failed.
    #[error("Provider failure: {0}")]
    Provider(#[from] ProviderError),

    /// The provider's circuit breaker short-circuited the call; the provider was not contacted.
    #[error("Circuit breaker is open for provider {provider}")]
    CircuitOpen { provider: Arc<str> },

    /// Every configured provider failed for this message.
    #[error("All providers failed for message {message_id}: {}", summarise(.failures))]
    AllProvidersExhausted {
        message_id: MessageId,
        failures: Vec<ProviderFailure>,
    },

    /// The caller cancelled the send while it was suspended.
    #[error("Delivery cancelled")]
    Cancelled,

    /// Invalid orchestrator configuration.
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),
}

/// Failure reported by a [`Provider`](crate::Provider).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// Transient failure (timeouts, throttling, 4xx-style responses). Retried with backoff.
    #[error("Temporary failure: {0}")]
    Temporary(String),

    /// The provider definitively rejected the message. Not retried on this provider.
    #[error("Permanent failure: {0}")]
    Permanent(String),
}

/// Configuration errors, surfaced when an orchestrator is built.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A configuration value is out of range.
    #[error("Invalid configuration for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    /// The orchestrator needs at least one provider.
    #[error("No delivery providers configured")]
    NoProviders,

    /// Provider names key the breaker overrides and events, so they must be unique.
    #[error("Duplicate provider name: {0}")]
    DuplicateProvider(String),
}

/// One provider's contribution to an [`DeliveryError::AllProvidersExhausted`] error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderFailure {
    pub provider: Arc<str>,
    pub cause: String,
}

impl Display for ProviderFailure {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        write!(fmt, "{} ({})", self.provider, self.cause)
    }
}

fn summarise(failures: &[ProviderFailure]) -> String {
    if failures.is_empty() {
        return "no providers attempted".to_string();
    }

    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl DeliveryError {
    /// Returns `true` if another attempt against the same provider may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Provider(ProviderError::Temporary(_)))
    }

    /// Returns `true` if the provider permanently rejected the message.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Provider(ProviderError::Permanent(_)))
    }

    /// Returns `true` if the call was short-circuited by an open breaker.
    #[must_use]
    pub const fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Returns `true` if the send was cancelled by the caller.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns `true` if every provider was exhausted.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        matches!(self, Self::AllProvidersExhausted { .. })
    }

    /// Whether this outcome says anything about the provider's health.
    ///
    /// Cancellation does not, so it must not move a circuit breaker.
    #[must_use]
    pub const fn counts_against_provider(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

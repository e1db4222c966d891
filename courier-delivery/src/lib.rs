//! Resilient delivery orchestration
//!
//! This crate provides functionality to:
//! - Deduplicate sends by message identifier
//! - Throttle dispatch with a global token bucket
//! - Isolate failing providers behind per-provider circuit breakers
//! - Retry transient failures with exponential backoff
//! - Fail over to the next provider in priority order
//!
//! The entry point is [`DeliveryOrchestrator`], built with
//! [`DeliveryOrchestrator::builder`].

pub mod circuit_breaker;
mod config;
mod error;
mod events;
mod orchestrator;
mod provider;
pub mod rate_limiter;
mod record;
pub mod retry;

// Re-export resilience building blocks
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState,
    ProviderCircuitBreakerConfig,
};
// Re-export configuration
pub use config::OrchestratorConfig;
// Re-export common types
pub use courier_common::{DeliveryStatus, Message, MessageId};
// Re-export error types
pub use error::{ConfigError, DeliveryError, ProviderError, ProviderFailure};
pub use events::{DeliveryEvent, EventBus, EventKind};
// Re-export core types
pub use orchestrator::{DeliveryOrchestrator, DeliveryOrchestratorBuilder, Receipt, SendOutcome};
pub use provider::{Ack, MockProvider, Provider};
pub use rate_limiter::{RateLimitConfig, RateLimitStats, RateLimiter};
pub use record::DeliveryRecord;
pub use retry::RetryPolicy;

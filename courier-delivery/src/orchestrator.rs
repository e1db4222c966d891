//! The delivery pipeline
//!
//! For every provider, in priority order, a send goes through:
//!
//! ```text
//! rate limiter token -> provider's circuit breaker -> retry with backoff -> provider
//! ```
//!
//! The first provider to accept the message ends the send. A provider whose
//! breaker is open, whose retries run out, or which rejects the message outright
//! is recorded as a failure and the next provider is tried.

use std::sync::Arc;

use courier_common::{DeliveryStatus, Message, MessageId, internal, tracing};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, Semaphore, broadcast};
use tokio_util::sync::CancellationToken;

use crate::{
    circuit_breaker::{CircuitBreaker, CircuitBreakerStats, CircuitState},
    config::OrchestratorConfig,
    error::{ConfigError, DeliveryError, ProviderFailure},
    events::{DeliveryEvent, EventBus, EventKind},
    provider::{Ack, Provider},
    rate_limiter::{RateLimitStats, RateLimiter},
    record::DeliveryRecord,
    retry::RetryPolicy,
};

/// Where and how a message was delivered
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Receipt {
    /// The provider that accepted the message
    pub provider: Arc<str>,
    /// The provider's acknowledgement
    pub ack: Ack,
}

/// Result of a successful `send`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SendOutcome {
    /// A provider accepted the message
    Delivered(Receipt),
    /// The identifier had already been sent; no provider was contacted
    Duplicate,
}

impl SendOutcome {
    #[must_use]
    pub const fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate)
    }

    /// The receipt, if this send delivered the message
    #[must_use]
    pub const fn receipt(&self) -> Option<&Receipt> {
        match self {
            Self::Delivered(receipt) => Some(receipt),
            Self::Duplicate => None,
        }
    }
}

/// A provider paired with its own breaker
struct ProviderSlot {
    name: Arc<str>,
    provider: Arc<dyn Provider>,
    breaker: CircuitBreaker,
}

type InFlightLocks = DashMap<MessageId, Arc<AsyncMutex<()>>>;

/// Holds the per-identifier lock for the duration of one send
///
/// The map entry is removed once nobody else holds or waits on it.
struct InFlight<'a> {
    locks: &'a InFlightLocks,
    id: MessageId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Coordinates deduplication, rate limiting, circuit breaking, retry, and failover
///
/// Cheap to share behind an [`Arc`]; every method takes `&self`.
pub struct DeliveryOrchestrator {
    providers: Vec<ProviderSlot>,
    rate_limiter: RateLimiter,
    retry: RetryPolicy,
    record: DeliveryRecord,
    in_flight: InFlightLocks,
    permits: Semaphore,
    events: EventBus,
}

impl std::fmt::Debug for DeliveryOrchestrator {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("DeliveryOrchestrator")
            .field(
                "providers",
                &self.providers.iter().map(|slot| &slot.name).collect::<Vec<_>>(),
            )
            .field("rate_limiter", &self.rate_limiter)
            .field("retry", &self.retry)
            .field("record", &self.record.len())
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

impl DeliveryOrchestrator {
    #[must_use]
    pub fn builder() -> DeliveryOrchestratorBuilder {
        DeliveryOrchestratorBuilder::new()
    }

    /// Send `message` through the pipeline
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::AllProvidersExhausted`] if no provider accepted the
    /// message, or [`DeliveryError::Cancelled`] if the orchestrator was shut down.
    pub async fn send(&self, message: &Message) -> Result<SendOutcome, DeliveryError> {
        self.send_with_cancel(message, &CancellationToken::new())
            .await
    }

    /// Send `message`, giving up if `cancel` fires while the send is waiting
    ///
    /// Cancellation is observed while waiting for an in-flight slot, for another
    /// send of the same identifier, for a rate limiter token, and during retry
    /// backoff. A provider call that has already started is allowed to finish.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::AllProvidersExhausted`] if no provider accepted the
    /// message, or [`DeliveryError::Cancelled`] if the send was cancelled.
    #[tracing::instrument(skip_all, fields(message_id = %message.id()))]
    pub async fn send_with_cancel(
        &self,
        message: &Message,
        cancel: &CancellationToken,
    ) -> Result<SendOutcome, DeliveryError> {
        let result = self.dispatch(message, cancel).await;

        if let Err(DeliveryError::Cancelled) = &result {
            tracing::debug!(message_id = %message.id(), "Send cancelled");
            self.events
                .emit(message.id(), None, EventKind::Cancelled);
        }

        result
    }

    async fn dispatch(
        &self,
        message: &Message,
        cancel: &CancellationToken,
    ) -> Result<SendOutcome, DeliveryError> {
        let id = message.id();

        let _permit = tokio::select! {
            biased;

            () = cancel.cancelled() => return Err(DeliveryError::Cancelled),
            permit = self.permits.acquire() => permit.map_err(|_| DeliveryError::Cancelled)?,
        };

        let _in_flight = self.lock_identifier(id, cancel).await?;

        if self.record.is_sent(id.as_str()) {
            tracing::info!(message_id = %id, "Duplicate message, already sent");
            self.events.emit(id, None, EventKind::Duplicate);
            return Ok(SendOutcome::Duplicate);
        }

        let mut failures = Vec::with_capacity(self.providers.len());

        for slot in &self.providers {
            match self.attempt_with(slot, message, cancel).await {
                Ok(ack) => {
                    self.record.mark_sent(id);

                    tracing::info!(
                        message_id = %id,
                        provider = %slot.name,
                        ack = %ack,
                        "Message delivered"
                    );

                    self.events.emit(
                        id,
                        Some(&slot.name),
                        EventKind::ProviderSucceeded {
                            ack: ack.to_string(),
                        },
                    );
                    self.events.emit(id, Some(&slot.name), EventKind::Delivered);

                    return Ok(SendOutcome::Delivered(Receipt {
                        provider: Arc::clone(&slot.name),
                        ack,
                    }));
                }
                Err(DeliveryError::Cancelled) => return Err(DeliveryError::Cancelled),
                Err(err) => {
                    self.record.mark_failed(id);

                    tracing::warn!(
                        message_id = %id,
                        provider = %slot.name,
                        error = %err,
                        "Provider failed, trying next provider"
                    );

                    let cause = err.to_string();
                    self.events.emit(
                        id,
                        Some(&slot.name),
                        EventKind::ProviderFailed {
                            cause: cause.clone(),
                        },
                    );
                    failures.push(ProviderFailure {
                        provider: Arc::clone(&slot.name),
                        cause,
                    });
                }
            }
        }

        tracing::error!(
            message_id = %id,
            providers = failures.len(),
            "All providers failed, message not sent"
        );
        self.events.emit(id, None, EventKind::Exhausted);

        Err(DeliveryError::AllProvidersExhausted {
            message_id: id.clone(),
            failures,
        })
    }

    /// One provider's turn: a token, then the retry sequence inside the breaker
    async fn attempt_with(
        &self,
        slot: &ProviderSlot,
        message: &Message,
        cancel: &CancellationToken,
    ) -> Result<Ack, DeliveryError> {
        self.rate_limiter.acquire(cancel).await?;

        slot.breaker
            .execute(|| {
                self.retry.run(cancel, |attempt| {
                    let provider = &slot.provider;
                    async move {
                        tracing::trace!(
                            message_id = %message.id(),
                            provider = provider.name(),
                            attempt = attempt + 1,
                            "Attempting delivery"
                        );

                        provider
                            .attempt_delivery(message)
                            .await
                            .map_err(DeliveryError::from)
                    }
                })
            })
            .await
    }

    /// Wait until no other send for `id` is running
    async fn lock_identifier(
        &self,
        id: &MessageId,
        cancel: &CancellationToken,
    ) -> Result<InFlight<'_>, DeliveryError> {
        let lock = Arc::clone(&*self.in_flight.entry(id.clone()).or_default());

        let mut in_flight = InFlight {
            locks: &self.in_flight,
            id: id.clone(),
            guard: None,
        };

        let guard = tokio::select! {
            biased;

            () = cancel.cancelled() => return Err(DeliveryError::Cancelled),
            guard = lock.lock_owned() => guard,
        };

        in_flight.guard = Some(guard);
        Ok(in_flight)
    }

    /// Current status of `id`, [`DeliveryStatus::Unknown`] if never seen
    pub fn status_of(&self, id: &str) -> DeliveryStatus {
        self.record.status_of(id)
    }

    /// The status store backing this orchestrator
    pub const fn record(&self) -> &DeliveryRecord {
        &self.record
    }

    /// Receive every [`DeliveryEvent`] emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.events.subscribe()
    }

    /// Provider names, in priority order
    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.providers.iter().map(|slot| &*slot.name)
    }

    /// Breaker state for the named provider
    pub fn breaker_state(&self, provider: &str) -> Option<CircuitState> {
        self.slot(provider).map(|slot| slot.breaker.state())
    }

    pub fn breaker_stats(&self, provider: &str) -> Option<CircuitBreakerStats> {
        self.slot(provider).map(|slot| slot.breaker.stats())
    }

    pub fn rate_limit_stats(&self) -> RateLimitStats {
        self.rate_limiter.stats()
    }

    /// Whether sends are still accepted and the rate limiter is still refilling
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.permits.is_closed() && self.rate_limiter.is_running()
    }

    /// Stop accepting sends and stop the rate limiter's refill task
    ///
    /// Sends waiting for an in-flight slot or a rate limiter token fail with
    /// [`DeliveryError::Cancelled`]. Sends already talking to a provider finish.
    pub fn shutdown(&self) {
        self.permits.close();
        self.rate_limiter.shutdown();
        internal!("Delivery orchestrator shut down");
    }

    fn slot(&self, provider: &str) -> Option<&ProviderSlot> {
        self.providers.iter().find(|slot| &*slot.name == provider)
    }
}

/// Builder for a [`DeliveryOrchestrator`]
///
/// Providers are tried in the order they are added.
#[derive(Default)]
pub struct DeliveryOrchestratorBuilder {
    config: OrchestratorConfig,
    providers: Vec<Arc<dyn Provider>>,
}

impl DeliveryOrchestratorBuilder {
    fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Append a provider at the lowest priority so far
    #[must_use]
    pub fn with_provider(self, provider: impl Provider + 'static) -> Self {
        self.with_shared_provider(Arc::new(provider))
    }

    /// Append a provider the caller keeps a handle to
    #[must_use]
    pub fn with_shared_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Validate the configuration and start the rate limiter
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Configuration`] if the configuration is invalid, no
    /// provider was added, or two providers share a name.
    pub fn build(self) -> Result<DeliveryOrchestrator, DeliveryError> {
        let Self { config, providers } = self;

        config.validate()?;

        if providers.is_empty() {
            return Err(ConfigError::NoProviders.into());
        }

        let mut slots: Vec<ProviderSlot> = Vec::with_capacity(providers.len());
        for provider in providers {
            let name: Arc<str> = Arc::from(provider.name());

            if slots.iter().any(|slot| slot.name == name) {
                return Err(ConfigError::DuplicateProvider(name.to_string()).into());
            }

            let breaker =
                CircuitBreaker::new(Arc::clone(&name), config.circuit_breaker.for_provider(&name));

            slots.push(ProviderSlot {
                name,
                provider,
                breaker,
            });
        }

        let rate_limiter = RateLimiter::new(&config.rate_limit)?;

        tracing::info!(
            providers = ?slots.iter().map(|slot| &*slot.name).collect::<Vec<_>>(),
            max_in_flight = config.max_in_flight,
            "Delivery orchestrator ready"
        );

        Ok(DeliveryOrchestrator {
            providers: slots,
            rate_limiter,
            retry: config.retry,
            record: DeliveryRecord::new(),
            in_flight: DashMap::new(),
            permits: Semaphore::new(config.max_in_flight),
            events: EventBus::new(config.event_capacity),
        })
    }
}

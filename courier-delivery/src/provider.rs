//! Delivery provider abstraction
//!
//! A provider is whatever actually moves a message out of the process: an SMTP
//! relay, an HTTP API, a queue. The orchestrator only sees this trait.

use std::{
    fmt::{self, Display, Formatter},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use courier_common::{Message, MessageId, outgoing};
use dashmap::DashSet;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// Acknowledgement returned by a provider on success
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ack(String);

impl Ack {
    #[must_use]
    pub fn new(description: impl Into<String>) -> Self {
        Self(description.into())
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.0
    }
}

impl Display for Ack {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str(&self.0)
    }
}

/// A pluggable delivery transport
///
/// `attempt_delivery` may be called several times for the same message (retries,
/// or a fresh send after an earlier failure). Each call is a fresh attempt.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Name used in logs, events, and breaker overrides
    fn name(&self) -> &str;

    /// Try to deliver `message` once
    async fn attempt_delivery(&self, message: &Message) -> Result<Ack, ProviderError>;
}

#[async_trait]
impl<P: Provider + ?Sized> Provider for Arc<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn attempt_delivery(&self, message: &Message) -> Result<Ack, ProviderError> {
        (**self).attempt_delivery(message).await
    }
}

/// In-memory provider that fails at random with a configurable rate
///
/// A `fail_rate` of `0.0` always succeeds and `1.0` always fails.
#[derive(Debug)]
pub struct MockProvider {
    name: Arc<str>,
    fail_rate: f64,
    delivered: DashSet<MessageId>,
    attempts: AtomicU64,
}

impl MockProvider {
    #[must_use]
    pub fn new(name: impl AsRef<str>, fail_rate: f64) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
            fail_rate: fail_rate.clamp(0.0, 1.0),
            delivered: DashSet::new(),
            attempts: AtomicU64::new(0),
        }
    }

    /// Number of times `attempt_delivery` has been called
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Whether this provider has accepted `id`
    pub fn has_delivered(&self, id: &MessageId) -> bool {
        self.delivered.contains(id)
    }

    /// Number of distinct messages accepted
    pub fn delivered_count(&self) -> usize {
        self.delivered.len()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn attempt_delivery(&self, message: &Message) -> Result<Ack, ProviderError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if rand::random::<f64>() < self.fail_rate {
            outgoing!(
                level = DEBUG,
                "{} rejected message {}",
                self.name,
                message.id()
            );
            return Err(ProviderError::Temporary(format!(
                "{} failed to send email.",
                self.name
            )));
        }

        self.delivered.insert(message.id().clone());
        outgoing!("{} accepted message {}", self.name, message.id());

        Ok(Ack::new(format!(
            "{} sent email to {}",
            self.name,
            message.recipient()
        )))
    }
}

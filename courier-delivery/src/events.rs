//! Diagnostic events emitted by the orchestrator
//!
//! One event per provider attempt outcome and one per terminal send outcome.
//! Events are fanned out on a bounded broadcast channel; the orchestrator never
//! formats or stores them. A subscriber that falls behind misses the oldest events.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use courier_common::MessageId;
use serde::Serialize;
use tokio::sync::broadcast;

/// What happened
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// The identifier was already sent; no provider was contacted
    Duplicate,
    /// A provider accepted the message
    ProviderSucceeded { ack: String },
    /// A provider's sequence failed (breaker open, retries exhausted, or rejection)
    ProviderFailed { cause: String },
    /// Terminal: the message was delivered
    Delivered,
    /// Terminal: every provider failed
    Exhausted,
    /// Terminal: the caller cancelled the send
    Cancelled,
}

impl EventKind {
    /// Whether this event ends a send call
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Duplicate | Self::Delivered | Self::Exhausted | Self::Cancelled
        )
    }
}

/// A single diagnostic event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryEvent {
    pub timestamp: DateTime<Utc>,
    pub message_id: MessageId,
    pub provider: Option<Arc<str>>,
    pub kind: EventKind,
}

/// Fan-out point for [`DeliveryEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DeliveryEvent>,
}

impl EventBus {
    /// `capacity` bounds how far a subscriber may lag before missing events
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, message_id: &MessageId, provider: Option<&Arc<str>>, kind: EventKind) {
        // Nobody listening is fine
        let _ = self.sender.send(DeliveryEvent {
            timestamp: Utc::now(),
            message_id: message_id.clone(),
            provider: provider.cloned(),
            kind,
        });
    }
}

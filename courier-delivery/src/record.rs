//! Delivery status store

use std::sync::Arc;

use courier_common::{DeliveryStatus, MessageId};
use dashmap::DashMap;

/// Status of every identifier this orchestrator has seen
///
/// In-memory only and never evicted. `Sent` is terminal: [`DeliveryRecord::mark_failed`]
/// leaves a `Sent` entry untouched.
#[derive(Debug, Clone, Default)]
pub struct DeliveryRecord {
    /// Map of message IDs to status (lock-free concurrent access)
    statuses: Arc<DashMap<MessageId, DeliveryStatus>>,
}

impl DeliveryRecord {
    /// Create a new empty record
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current status, `Unknown` for identifiers never recorded
    pub fn status_of(&self, id: &str) -> DeliveryStatus {
        self.statuses
            .get(id)
            .map_or(DeliveryStatus::Unknown, |entry| *entry.value())
    }

    /// Whether `id` has been confirmed sent
    pub fn is_sent(&self, id: &str) -> bool {
        self.status_of(id).is_sent()
    }

    pub fn mark_sent(&self, id: &MessageId) {
        self.statuses.insert(id.clone(), DeliveryStatus::Sent);
    }

    /// Record a failure, unless the identifier is already `Sent`
    pub fn mark_failed(&self, id: &MessageId) {
        self.statuses
            .entry(id.clone())
            .and_modify(|status| {
                if !status.is_sent() {
                    *status = DeliveryStatus::Failed;
                }
            })
            .or_insert(DeliveryStatus::Failed);
    }

    /// Number of identifiers recorded
    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    /// All identifiers with the given status
    pub fn with_status(&self, status: DeliveryStatus) -> Vec<MessageId> {
        self.statuses
            .iter()
            .filter(|entry| *entry.value() == status)
            .map(|entry| entry.key().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_is_never_stored() {
        let record = DeliveryRecord::new();
        let id = MessageId::new("never-seen");

        assert_eq!(record.status_of(id.as_str()), DeliveryStatus::Unknown);
        assert!(record.is_empty());
    }

    #[test]
    fn test_failed_then_sent() {
        let record = DeliveryRecord::new();
        let id = MessageId::new("retry-me");

        record.mark_failed(&id);
        assert_eq!(record.status_of(id.as_str()), DeliveryStatus::Failed);

        record.mark_sent(&id);
        assert_eq!(record.status_of(id.as_str()), DeliveryStatus::Sent);
        assert_eq!(record.len(), 1);
    }

    #[test]
    fn test_sent_is_terminal() {
        let record = DeliveryRecord::new();
        let id = MessageId::new("done");

        record.mark_sent(&id);
        record.mark_failed(&id);

        assert!(record.is_sent(id.as_str()));
    }

    #[test]
    fn test_with_status() {
        let record = DeliveryRecord::new();
        record.mark_sent(&MessageId::new("a"));
        record.mark_failed(&MessageId::new("b"));
        record.mark_failed(&MessageId::new("c"));

        let mut failed = record.with_status(DeliveryStatus::Failed);
        failed.sort();
        assert_eq!(failed, vec![MessageId::new("b"), MessageId::new("c")]);
        assert_eq!(record.with_status(DeliveryStatus::Sent), vec![MessageId::new("a")]);
    }
}

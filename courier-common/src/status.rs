use core::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// Delivery status of a message identifier
///
/// `Unknown` is what a never-seen identifier reports; it is never stored.
/// `Sent` is terminal: once recorded it is never overwritten.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryStatus {
    #[default]
    Unknown,
    Sent,
    Failed,
}

impl DeliveryStatus {
    /// Checks if the status is the terminal `Sent` state
    pub const fn is_sent(self) -> bool {
        matches!(self, Self::Sent)
    }

    /// Checks if the last send for this identifier failed
    pub const fn is_failed(self) -> bool {
        matches!(self, Self::Failed)
    }
}

impl Display for DeliveryStatus {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str(match self {
            Self::Unknown => "UNKNOWN",
            Self::Sent => "SENT",
            Self::Failed => "FAILED",
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(DeliveryStatus::Unknown.to_string(), "UNKNOWN");
        assert_eq!(DeliveryStatus::Sent.to_string(), "SENT");
        assert_eq!(DeliveryStatus::Failed.to_string(), "FAILED");
    }

    #[test]
    fn test_status_default_is_unknown() {
        assert_eq!(DeliveryStatus::default(), DeliveryStatus::Unknown);
        assert!(!DeliveryStatus::Unknown.is_sent());
        assert!(DeliveryStatus::Sent.is_sent());
        assert!(DeliveryStatus::Failed.is_failed());
    }
}

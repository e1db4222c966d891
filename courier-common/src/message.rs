//! The unit of work handed to the orchestrator

use std::{
    borrow::Borrow,
    fmt::{self, Display, Formatter},
    sync::Arc,
};

use serde::{Deserialize, Serialize};

/// Caller-supplied, opaque message identifier used as the dedup key
///
/// Backed by an `Arc<str>` so it can be cloned into records, locks and events
/// without copying the underlying string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Arc<str>);

impl MessageId {
    #[must_use]
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for MessageId {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

// Hash and Eq of `MessageId` are those of the inner `str`, so lookups by `&str` are sound
impl Borrow<str> for MessageId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for MessageId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A message submitted for delivery. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    id: MessageId,
    recipient: Arc<str>,
    content: Arc<str>,
}

impl Message {
    #[must_use]
    pub fn new(
        id: impl Into<MessageId>,
        recipient: impl AsRef<str>,
        content: impl AsRef<str>,
    ) -> Self {
        Self {
            id: id.into(),
            recipient: Arc::from(recipient.as_ref()),
            content: Arc::from(content.as_ref()),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &MessageId {
        &self.id
    }

    #[must_use]
    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }
}

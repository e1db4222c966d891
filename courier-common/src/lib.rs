//! Types shared between the courier crates, plus logging setup.

pub mod logging;
pub mod message;
pub mod status;

pub use message::{Message, MessageId};
pub use status::DeliveryStatus;
pub use tracing;

pub mod config;
pub mod controller;

pub use config::{CourierConfig, ProviderConfig};
pub use controller::Courier;

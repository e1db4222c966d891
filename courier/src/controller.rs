use courier_common::{Message, internal, tracing};
use courier_delivery::{
    DeliveryError, DeliveryOrchestrator, DeliveryStatus, MockProvider, SendOutcome,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::CourierConfig;

/// The application: an orchestrator over the configured mock providers
#[derive(Debug)]
pub struct Courier {
    orchestrator: DeliveryOrchestrator,
}

impl Courier {
    /// Build the orchestrator and its providers
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the orchestrator configuration is invalid.
    pub fn from_config(config: CourierConfig) -> anyhow::Result<Self> {
        let CourierConfig {
            orchestrator,
            providers,
        } = config;

        let orchestrator = providers
            .iter()
            .fold(
                DeliveryOrchestrator::builder().with_config(orchestrator),
                |builder, provider| {
                    builder.with_provider(MockProvider::new(&provider.name, provider.fail_rate))
                },
            )
            .build()?;

        let courier = Self { orchestrator };
        courier.log_events();

        Ok(courier)
    }

    pub const fn orchestrator(&self) -> &DeliveryOrchestrator {
        &self.orchestrator
    }

    /// Send one message, cancelling it if CTRL+C is entered while it waits
    ///
    /// # Errors
    ///
    /// Returns the orchestrator's error if the message was not delivered.
    pub async fn send(&self, message: &Message) -> Result<SendOutcome, DeliveryError> {
        let cancel = CancellationToken::new();

        let interrupt = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    internal!("CTRL+C entered, cancelling send");
                    cancel.cancel();
                }
            })
        };

        let result = self.orchestrator.send_with_cancel(message, &cancel).await;
        interrupt.abort();

        result
    }

    pub fn status_of(&self, id: &str) -> DeliveryStatus {
        self.orchestrator.status_of(id)
    }

    pub fn shutdown(&self) {
        self.orchestrator.shutdown();
    }

    /// Mirror orchestrator events into the log
    fn log_events(&self) {
        let mut events = self.orchestrator.subscribe();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => tracing::debug!(
                        message_id = %event.message_id,
                        provider = event.provider.as_deref().unwrap_or("-"),
                        kind = ?event.kind,
                        "Delivery event"
                    ),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::debug!(missed, "Event log lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

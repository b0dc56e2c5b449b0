//! Consumers of published address sets.

use async_trait::async_trait;
use grpclb_core::PublishedState;
use tracing::info;

/// Receives the full address list whenever it changes.
///
/// Each call replaces the previous state. Calls are made in order from a
/// single task, so an implementation never sees two updates concurrently.
#[async_trait]
pub trait Consumer: Send + Sync + 'static {
    async fn update_state(&self, state: PublishedState);
}

/// Consumer that only logs what it receives.
#[derive(Debug, Clone)]
pub struct LoggingConsumer {
    service: String,
}

impl LoggingConsumer {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

#[async_trait]
impl Consumer for LoggingConsumer {
    async fn update_state(&self, state: PublishedState) {
        let addresses: Vec<String> = state
            .weighted_addresses()
            .into_iter()
            .map(|(addr, weight)| format!("{addr} (weight {weight})"))
            .collect();

        info!(
            service = %self.service,
            count = addresses.len(),
            addresses = ?addresses,
            "Address set updated"
        );
    }
}

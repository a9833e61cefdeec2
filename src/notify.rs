//! Notification dispatch.
//!
//! Events are handed over only after the change that raised them has been
//! committed. A failing notifier is logged and otherwise ignored.

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};
use crate::domain::events::DomainEvent;

pub const SUBJECT_PREFIX: &str = "shop.events";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to publish event: {0}")]
    Publish(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &DomainEvent) -> Result<(), NotifyError>;
}

/// Sends each event and swallows failures.
pub async fn dispatch(notifier: &dyn Notifier, events: Vec<DomainEvent>) {
    for event in events {
        if let Err(e) = notifier.notify(&event).await {
            warn!(event = %event.routing_key(), error = %e, "notification failed");
        }
    }
}

/// Writes events to the log. Used when no broker is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &DomainEvent) -> Result<(), NotifyError> {
        let payload = serde_json::to_string(event)?;
        info!(event = %event.routing_key(), %payload, "domain event");
        Ok(())
    }
}

/// Publishes JSON events on `shop.events.<aggregate>.<event>`.
#[derive(Clone)]
pub struct NatsNotifier {
    client: async_nats::Client,
}

impl NatsNotifier {
    pub fn new(client: async_nats::Client) -> Self { Self { client } }

    pub async fn connect(url: &str) -> Result<Self, NotifyError> {
        let client = async_nats::connect(url).await.map_err(|e| NotifyError::Publish(e.to_string()))?;
        info!(%url, "connected to NATS");
        Ok(Self { client })
    }
}

pub fn subject_for(event: &DomainEvent) -> String { format!("{SUBJECT_PREFIX}.{}", event.routing_key()) }

#[async_trait]
impl Notifier for NatsNotifier {
    async fn notify(&self, event: &DomainEvent) -> Result<(), NotifyError> {
        let payload = serde_json::to_vec(event)?;
        self.client.publish(subject_for(event), payload.into()).await.map_err(|e| NotifyError::Publish(e.to_string()))
    }
}

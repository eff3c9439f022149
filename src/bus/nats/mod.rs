//! NATS broadcast bus implementation.
//!
//! Core NATS (no JetStream): messages are not persisted, and a subscriber
//! that is offline at publish time misses them. Queue subscriptions give
//! competing-consumer load sharing across instances.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::{debug, info};

use super::{BusError, NotificationBus, Result};
use crate::notifier::BroadcastMessage;

/// Broadcast bus backed by a NATS connection.
#[derive(Clone)]
pub struct NatsNotificationBus {
    client: async_nats::Client,
}

impl NatsNotificationBus {
    /// Connect to the NATS server at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BusError::Connection(format!("Failed to connect to NATS: {}", e)))?;

        info!(url = %url, "Connected to NATS");

        Ok(Self::from_client(client))
    }

    pub fn from_client(client: async_nats::Client) -> Self {
        Self { client }
    }

    /// Join competing-consumer `group` on subject `pattern`.
    ///
    /// The subscription is flushed before returning, so the server has
    /// registered interest once this resolves.
    pub async fn queue_subscribe(
        &self,
        pattern: &str,
        group: &str,
    ) -> Result<BoxStream<'static, BroadcastMessage>> {
        let subscriber = self
            .client
            .queue_subscribe(pattern.to_string(), group.to_string())
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to subscribe: {}", e)))?;

        self.client
            .flush()
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to flush subscription: {}", e)))?;

        info!(subject = %pattern, group = %group, "Joined NATS queue group");

        Ok(subscriber
            .map(|msg| BroadcastMessage {
                subject: msg.subject.to_string(),
                payload: msg.payload,
            })
            .boxed())
    }
}

#[async_trait]
impl NotificationBus for NatsNotificationBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)))?;

        self.client
            .flush()
            .await
            .map_err(|e| BusError::Publish(format!("Failed to flush: {}", e)))?;

        debug!(subject = %subject, "Published notification");
        Ok(())
    }
}

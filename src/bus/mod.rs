//! Messaging substrates for order fan-out.
//!
//! This module contains:
//! - `NotificationBus` trait: fire-and-forget broadcast publish
//! - `WorkQueue` trait: persistent publish to the durable queue
//! - `DeliverySource` / `Acknowledger` traits: manual-ack consumption
//! - Implementations: NATS (broadcast), AMQP/RabbitMQ (durable queue),
//!   in-memory fakes for both

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod mock;
#[cfg(feature = "nats")]
pub mod nats;
mod subject;

#[cfg(feature = "amqp")]
pub use amqp::{AmqpDeliverySource, AmqpWorkQueue};
pub use mock::{InMemoryBroadcast, InMemoryConsumer, InMemoryQueue, InMemorySubscription};
#[cfg(feature = "nats")]
pub use nats::NatsNotificationBus;
pub use subject::subject_matches;

// ============================================================================
// Traits
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Publish timed out after {0:?}")]
    Timeout(Duration),

    #[error("Publish not confirmed by broker: {0}")]
    NotConfirmed(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Acknowledgment failed: {0}")]
    Acknowledge(String),

    #[error("Delivery failed: {0}")]
    Delivery(String),
}

/// Broadcast publish-subscribe bus.
///
/// Delivery is best effort: subscribers that are offline at publish time
/// miss the message.
#[async_trait]
pub trait NotificationBus: Send + Sync {
    /// Publish `payload` on `subject`.
    ///
    /// Returns once the broker connection has accepted the bytes, so
    /// connection failures surface to the caller.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()>;
}

/// Message handed to the durable work queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// JSON body.
    pub body: Vec<u8>,
    /// Publish timestamp carried as a message property.
    pub timestamp: DateTime<Utc>,
}

impl QueueMessage {
    pub const CONTENT_TYPE: &'static str = "application/json";

    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            timestamp: Utc::now(),
        }
    }
}

/// Durable work queue publisher.
///
/// Messages are published persistently; the broker keeps them across
/// restarts until a consumer acknowledges them.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn publish(&self, message: QueueMessage) -> Result<()>;
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Remove the message from the queue.
    async fn ack(&self) -> Result<()>;

    /// Reject the message. With `requeue` the broker redelivers it;
    /// without, the broker drops it or routes it to a dead-letter exchange.
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// A message delivered from the durable queue awaiting settlement.
pub struct QueueDelivery {
    pub body: Vec<u8>,
    /// Broker flag: this message was delivered before.
    pub redelivered: bool,
    /// 1-based delivery attempt, when the broker tracks it.
    pub attempt: Option<u32>,
    pub acker: Box<dyn Acknowledger>,
}

impl std::fmt::Debug for QueueDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueDelivery")
            .field("body_len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .field("attempt", &self.attempt)
            .finish()
    }
}

/// Stream of manual-ack deliveries from the durable queue.
#[async_trait]
pub trait DeliverySource: Send {
    /// Wait for the next delivery.
    ///
    /// Returns `None` once the consumer has been closed by the broker.
    async fn next_delivery(&mut self) -> Option<Result<QueueDelivery>>;
}

/// Run `publish` under a deadline, mapping expiry to `BusError::Timeout`.
pub async fn publish_with_timeout<F>(timeout: Duration, publish: F) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    match tokio::time::timeout(timeout, publish).await {
        Ok(result) => result,
        Err(_) => Err(BusError::Timeout(timeout)),
    }
}

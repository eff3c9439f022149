//! Order data model shared by the ingress, notifier and processor.
//!
//! Wire shapes are JSON with camelCase field names.

mod id;

pub use id::{OrderId, OrderIdGenerator, ORDER_ID_FORMAT};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Event tag carried by every notification.
pub const ORDER_CREATED: &str = "order.created";

/// Status written to every processed record.
pub const STATUS_PROCESSED: &str = "PROCESSED";

/// Source tag written to every processed record.
pub const PROCESSED_SOURCE: &str = "rabbitmq";

/// Order creation request as received over HTTP.
///
/// Only structural decoding is performed: absent fields fall back to their
/// zero values and unknown fields are ignored. `amount` must be a JSON
/// number; a string amount is a decode failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrderRequest {
    pub amount: f64,
    pub currency: String,
    pub customer_id: String,
}

/// Lightweight broadcast notification for a newly created order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub order_id: OrderId,
    /// RFC3339 with nanoseconds, UTC.
    pub timestamp: String,
}

impl NotificationEvent {
    pub fn order_created(order_id: OrderId, at: DateTime<Utc>) -> Self {
        Self {
            event_type: ORDER_CREATED.to_string(),
            order_id,
            timestamp: at.to_rfc3339_opts(SecondsFormat::Nanos, true),
        }
    }
}

/// Work item placed on the durable queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderMessage {
    pub order_id: OrderId,
    pub order: OrderRequest,
}

/// Document written to the search/index store once an order is processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedRecord {
    pub order_id: OrderId,
    pub status: String,
    /// RFC3339 with whole seconds, UTC.
    pub processed_at: String,
    pub source: String,
}

impl ProcessedRecord {
    pub fn processed(order_id: OrderId, at: DateTime<Utc>) -> Self {
        Self {
            order_id,
            status: STATUS_PROCESSED.to_string(),
            processed_at: at.to_rfc3339_opts(SecondsFormat::Secs, true),
            source: PROCESSED_SOURCE.to_string(),
        }
    }
}

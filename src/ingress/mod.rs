//! Ingress publisher: HTTP order intake with dual-sink fan-out.
//!
//! Each accepted order is given an identifier, announced on the broadcast
//! bus, and then placed on the durable work queue. The two publishes are
//! sequential and not atomic: a failed queue publish leaves the broadcast
//! in place and the caller only sees a server error.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use chrono::Utc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::bus::{publish_with_timeout, BusError, NotificationBus, QueueMessage, WorkQueue};
use crate::order::{NotificationEvent, OrderId, OrderIdGenerator, OrderMessage, OrderRequest};

/// Path of the order write endpoint.
pub const ORDERS_PATH: &str = "/orders";

/// Errors publishing an accepted order.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Notification publish failed: {0}")]
    Notification(#[source] BusError),

    #[error("Queue publish failed: {0}")]
    Queue(#[source] BusError),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Publishes accepted orders to the broadcast bus and the durable queue.
pub struct OrderPublisher {
    notifications: Arc<dyn NotificationBus>,
    queue: Arc<dyn WorkQueue>,
    ids: OrderIdGenerator,
    subject: String,
    notification_timeout: Duration,
    queue_timeout: Duration,
}

impl OrderPublisher {
    /// Both publishes are bounded by `queue_timeout` until
    /// [`with_notification_timeout`](Self::with_notification_timeout) says otherwise.
    pub fn new(
        notifications: Arc<dyn NotificationBus>,
        queue: Arc<dyn WorkQueue>,
        subject: impl Into<String>,
        queue_timeout: Duration,
    ) -> Self {
        Self {
            notifications,
            queue,
            ids: OrderIdGenerator::new(),
            subject: subject.into(),
            notification_timeout: queue_timeout,
            queue_timeout,
        }
    }

    pub fn with_notification_timeout(mut self, timeout: Duration) -> Self {
        self.notification_timeout = timeout;
        self
    }

    /// Mint an identifier for `order` and publish it to both sinks.
    ///
    /// The queue publish is only attempted once the broadcast publish has
    /// succeeded. Nothing is retried or rolled back.
    #[tracing::instrument(name = "ingress.publish", skip_all, fields(order_id = tracing::field::Empty))]
    pub async fn publish(&self, order: OrderRequest) -> Result<OrderId, PublishError> {
        let order_id = self.ids.mint();
        tracing::Span::current().record("order_id", order_id.as_str());

        let event = NotificationEvent::order_created(order_id.clone(), Utc::now());
        let payload = serde_json::to_vec(&event)?;
        publish_with_timeout(
            self.notification_timeout,
            self.notifications.publish(&self.subject, payload.into()),
        )
        .await
        .map_err(PublishError::Notification)?;

        let message = OrderMessage {
            order_id: order_id.clone(),
            order,
        };
        let body = serde_json::to_vec(&message)?;
        publish_with_timeout(self.queue_timeout, self.queue.publish(QueueMessage::new(body)))
            .await
            .map_err(PublishError::Queue)?;

        info!(subject = %self.subject, "Order published");
        Ok(order_id)
    }
}

/// Build the ingress router.
pub fn router(publisher: Arc<OrderPublisher>) -> Router {
    Router::new()
        .route(
            ORDERS_PATH,
            post(create_order).fallback(method_not_allowed),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(publisher)
}

/// Serve `app` on `listener` until `shutdown` flips to true.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "Ingress listening");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
            info!("Ingress shutting down");
        })
        .await
}

// ============================================================================
// Handlers
// ============================================================================

async fn create_order(State(publisher): State<Arc<OrderPublisher>>, body: Bytes) -> Response {
    let order: OrderRequest = match serde_json::from_slice(&body) {
        Ok(order) => order,
        Err(e) => {
            warn!(error = %e, "Rejected undecodable order");
            return (StatusCode::BAD_REQUEST, "invalid json").into_response();
        }
    };

    match publisher.publish(order).await {
        Ok(_) => StatusCode::CREATED.into_response(),
        Err(e) => {
            error!(error = %e, "Order publish failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "order publish failed").into_response()
        }
    }
}

async fn method_not_allowed() -> (StatusCode, &'static str) {
    (StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
}

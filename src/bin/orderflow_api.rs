//! orderflow-api: Order ingress
//!
//! Accepts orders over HTTP and fans each one out to the broadcast bus and
//! the durable work queue.
//!
//! ## Architecture
//! ```text
//! [Client] --POST /orders--> [orderflow-api] --order.created--> [NATS]
//!                                   |
//!                                   +--persistent--> [RabbitMQ order.queue]
//! ```
//!
//! ## Configuration
//! - HTTP_ADDR: Listen address (default: 0.0.0.0:8080)
//! - NATS_URL: NATS server (default: nats://localhost:4222)
//! - RABBITMQ_URL / RABBITMQ_QUEUE: Work queue broker and queue name
//! - ORDERFLOW_CONFIG: Optional YAML config file

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use orderflow::bus::{AmqpWorkQueue, NatsNotificationBus};
use orderflow::config::Config;
use orderflow::ingress::{router, serve, OrderPublisher};
use orderflow::utils::bootstrap::{init_tracing, shutdown_channel, spawn_signal_listener};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!("Starting orderflow-api");

    let notifications = NatsNotificationBus::connect(&config.nats.url)
        .await
        .map_err(|e| {
            error!(url = %config.nats.url, error = %e, "NATS connect failed");
            e
        })?;

    let queue = AmqpWorkQueue::connect(config.amqp.clone())
        .await
        .map_err(|e| {
            error!(queue = %config.amqp.queue, error = %e, "RabbitMQ connect failed");
            e
        })?;

    let publisher = Arc::new(
        OrderPublisher::new(
            Arc::new(notifications),
            Arc::new(queue),
            config.nats.publish_subject.clone(),
            config.amqp.publish_timeout(),
        )
        .with_notification_timeout(config.nats.publish_timeout()),
    );

    let listener = TcpListener::bind(config.http.bind_addr()).await?;

    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    spawn_signal_listener(shutdown_tx);

    serve(listener, router(publisher), shutdown_rx).await?;

    info!("orderflow-api stopped");
    Ok(())
}

//! orderflow-notifier: Notification fan-out consumer
//!
//! Joins a NATS queue group and logs every order notification. Running
//! several instances shares the load across the group.
//!
//! ## Configuration
//! - NATS_URL: NATS server (default: nats://localhost:4222)
//! - NATS_SUBJECT: Subject pattern (default: order.*)
//! - NATS_QUEUE_GROUP: Queue group (default: notification-workers)

use tracing::{error, info};

use orderflow::bus::NatsNotificationBus;
use orderflow::config::Config;
use orderflow::notifier;
use orderflow::utils::bootstrap::{init_tracing, shutdown_channel, spawn_signal_listener};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    let bus = NatsNotificationBus::connect(&config.nats.url).await?;
    let subscription = bus
        .queue_subscribe(&config.nats.subscribe_subject, &config.nats.queue_group)
        .await?;

    info!(
        subject = %config.nats.subscribe_subject,
        group = %config.nats.queue_group,
        "orderflow-notifier started"
    );

    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    spawn_signal_listener(shutdown_tx);

    let handled = notifier::run(subscription, shutdown_rx).await;

    info!(handled, "orderflow-notifier stopped");
    Ok(())
}

//! orderflow-processor: Order processor
//!
//! Consumes the durable work queue with a prefetch of one and manual
//! acknowledgment, and writes a processed record per order to Elasticsearch.
//!
//! ## Architecture
//! ```text
//! [RabbitMQ order.queue] -> [orderflow-processor] -> [Elasticsearch orders]
//!          ^                        |
//!          +------ nack/requeue ----+
//! ```
//!
//! ## Configuration
//! - RABBITMQ_URL / RABBITMQ_QUEUE: Work queue broker and queue name
//! - ES_URL / ES_INDEX / ES_USER / ES_PASS: Search store
//! - ORDERFLOW__PROCESSOR__REDELIVERY__MAX_ATTEMPTS: Dead-letter after N attempts

use std::sync::Arc;

use tracing::{error, info};

use orderflow::bus::AmqpWorkQueue;
use orderflow::config::Config;
use orderflow::processor::OrderProcessor;
use orderflow::search::ElasticsearchIndex;
use orderflow::utils::bootstrap::{init_tracing, shutdown_channel, spawn_signal_listener};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    let index = ElasticsearchIndex::new(&config.search)?;
    let processor = OrderProcessor::from_config(Arc::new(index), &config);
    processor.prepare().await.map_err(|e| {
        error!(index = %config.search.index, error = %e, "Failed to ensure index");
        e
    })?;

    let queue = AmqpWorkQueue::connect(config.amqp.clone()).await?;
    let consumer_tag = format!("orderflow-processor-{}", uuid::Uuid::new_v4());

    info!(
        queue = %queue.queue_name(),
        index = %config.search.index,
        "orderflow-processor consuming"
    );

    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    spawn_signal_listener(shutdown_tx);

    processor
        .consume_with_reconnect(|| queue.consume(&consumer_tag), shutdown_rx)
        .await?;

    info!("orderflow-processor stopped");
    Ok(())
}

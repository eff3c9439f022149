//! AMQP (RabbitMQ) durable work queue implementation.
//!
//! Messages are published through the default exchange directly to a single
//! named queue. The queue is durable, non-exclusive and never auto-deleted;
//! messages are persistent and published with confirms enabled.

use async_trait::async_trait;
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    Acknowledger, BusError, DeliverySource, QueueDelivery, QueueMessage, Result, WorkQueue,
};
use crate::config::{AmqpConfig, QueueType};

/// Unacknowledged deliveries allowed per consumer.
pub const PREFETCH_COUNT: u16 = 1;

/// AMQP delivery mode for messages the broker writes to disk.
const PERSISTENT: u8 = 2;

/// Header quorum queues use to count previous delivery attempts.
const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

/// Durable work queue on RabbitMQ.
pub struct AmqpWorkQueue {
    pool: Pool,
    config: AmqpConfig,
    publish_channel: Mutex<Option<Channel>>,
}

impl AmqpWorkQueue {
    /// Connect and declare the queue.
    pub async fn connect(config: AmqpConfig) -> Result<Self> {
        let manager = Manager::new(config.url.clone(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(config.pool_size)
            .build()
            .map_err(|e| BusError::Connection(format!("Failed to create pool: {}", e)))?;

        let channel = Self::open_channel(&pool).await?;
        declare_queue(&channel, &config).await?;

        info!(
            queue = %config.queue,
            queue_type = ?config.queue_type,
            "Connected to AMQP"
        );

        Ok(Self {
            pool,
            config,
            publish_channel: Mutex::new(None),
        })
    }

    pub fn queue_name(&self) -> &str {
        &self.config.queue
    }

    async fn open_channel(pool: &Pool) -> Result<Channel> {
        let conn = pool.get().await.map_err(|e: PoolError| {
            BusError::Connection(format!("Failed to get connection from pool: {}", e))
        })?;

        conn.create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))
    }

    /// Get the confirm-mode publish channel, reopening it if it was closed.
    async fn publish_channel(&self) -> Result<Channel> {
        let mut guard = self.publish_channel.lock().await;
        if let Some(channel) = guard.as_ref() {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
        }

        let channel = Self::open_channel(&self.pool).await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BusError::Connection(format!("Failed to enable confirms: {}", e)))?;

        *guard = Some(channel.clone());
        Ok(channel)
    }

    async fn discard_publish_channel(&self) {
        self.publish_channel.lock().await.take();
    }

    /// Start a manual-ack consumer with a prefetch of one.
    pub async fn consume(&self, consumer_tag: &str) -> Result<AmqpDeliverySource> {
        let channel = Self::open_channel(&self.pool).await?;
        declare_queue(&channel, &self.config).await?;

        channel
            .basic_qos(PREFETCH_COUNT, BasicQosOptions::default())
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to set prefetch: {}", e)))?;

        let consumer = channel
            .basic_consume(
                &self.config.queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))?;

        info!(
            queue = %self.config.queue,
            consumer_tag = %consumer_tag,
            prefetch = PREFETCH_COUNT,
            "Consumer started"
        );

        Ok(AmqpDeliverySource {
            consumer,
            _channel: channel,
        })
    }
}

#[async_trait]
impl WorkQueue for AmqpWorkQueue {
    #[tracing::instrument(name = "queue.publish", skip_all, fields(queue = %self.config.queue))]
    async fn publish(&self, message: QueueMessage) -> Result<()> {
        let channel = self.publish_channel().await?;

        let properties = BasicProperties::default()
            .with_content_type(QueueMessage::CONTENT_TYPE.into())
            .with_delivery_mode(PERSISTENT)
            .with_timestamp(message.timestamp.timestamp().max(0) as u64);

        let confirm = match channel
            .basic_publish(
                "",
                &self.config.queue,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
        {
            Ok(confirm) => confirm,
            Err(e) => {
                self.discard_publish_channel().await;
                return Err(BusError::Publish(format!("Failed to publish: {}", e)));
            }
        };

        let confirmation = match confirm.await {
            Ok(confirmation) => confirmation,
            Err(e) => {
                self.discard_publish_channel().await;
                return Err(BusError::Publish(format!(
                    "Publish confirmation failed: {}",
                    e
                )));
            }
        };

        if confirmation.is_nack() {
            return Err(BusError::NotConfirmed(format!(
                "broker nacked message for queue {}",
                self.config.queue
            )));
        }

        debug!(queue = %self.config.queue, "Published order message");
        Ok(())
    }
}

/// Declare the work queue: durable, non-exclusive, not auto-deleted.
async fn declare_queue(channel: &Channel, config: &AmqpConfig) -> Result<()> {
    channel
        .queue_declare(
            &config.queue,
            QueueDeclareOptions {
                durable: true,
                exclusive: false,
                auto_delete: false,
                ..Default::default()
            },
            queue_arguments(config),
        )
        .await
        .map_err(|e| BusError::Connection(format!("Failed to declare queue: {}", e)))?;
    Ok(())
}

/// Declaration arguments for the work queue.
///
/// Classic queues without a dead-letter exchange are declared with no
/// arguments so they stay compatible with queues created by other clients.
fn queue_arguments(config: &AmqpConfig) -> FieldTable {
    let mut args = FieldTable::default();
    if config.queue_type == QueueType::Quorum {
        args.insert("x-queue-type".into(), AMQPValue::LongString("quorum".into()));
    }
    if let Some(exchange) = &config.dead_letter_exchange {
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(exchange.as_str().into()),
        );
    }
    args
}

/// 1-based delivery attempt derived from broker metadata.
///
/// Quorum queues stamp `x-delivery-count` (previous deliveries) on
/// redeliveries. Classic queues only expose the redelivered flag, so a
/// redelivery there has no known attempt number.
fn delivery_attempt(properties: &BasicProperties, redelivered: bool) -> Option<u32> {
    let count = properties
        .headers()
        .as_ref()
        .and_then(|headers| headers.inner().get(DELIVERY_COUNT_HEADER))
        .and_then(|value| match value {
            AMQPValue::ShortShortInt(v) => u32::try_from(*v).ok(),
            AMQPValue::ShortShortUInt(v) => Some(u32::from(*v)),
            AMQPValue::ShortInt(v) => u32::try_from(*v).ok(),
            AMQPValue::ShortUInt(v) => Some(u32::from(*v)),
            AMQPValue::LongInt(v) => u32::try_from(*v).ok(),
            AMQPValue::LongUInt(v) => Some(*v),
            AMQPValue::LongLongInt(v) => u32::try_from(*v).ok(),
            _ => None,
        });

    match count {
        Some(previous) => Some(previous.saturating_add(1)),
        None if !redelivered => Some(1),
        None => None,
    }
}

/// Deliveries from a RabbitMQ consumer.
pub struct AmqpDeliverySource {
    consumer: lapin::Consumer,
    _channel: Channel,
}

#[async_trait]
impl DeliverySource for AmqpDeliverySource {
    async fn next_delivery(&mut self) -> Option<Result<QueueDelivery>> {
        let delivery = match self.consumer.next().await? {
            Ok(delivery) => delivery,
            Err(e) => {
                warn!(error = %e, "Consumer delivery error");
                return Some(Err(BusError::Delivery(e.to_string())));
            }
        };

        let attempt = delivery_attempt(&delivery.properties, delivery.redelivered);
        Some(Ok(QueueDelivery {
            redelivered: delivery.redelivered,
            attempt,
            body: delivery.data,
            acker: Box::new(AmqpAcker(delivery.acker)),
        }))
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BusError::Acknowledge(format!("ack failed: {}", e)))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|e| BusError::Acknowledge(format!("nack failed: {}", e)))
    }
}

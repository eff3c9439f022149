//! Order processor: durable-queue consumer that indexes processed orders.
//!
//! Each delivery runs through an explicit state machine:
//!
//! ```text
//! Received -> Decoded -> Validated -> Processed -> Indexed   => ack
//!     \           \           \                      \
//!      +-----------+-----------+----------------------+-> Failed => redelivery policy
//! ```
//!
//! Deliveries are handled one at a time; the consumer's prefetch of one
//! keeps the broker from handing this instance a second message while the
//! first is unsettled.

mod redelivery;

pub use redelivery::{Disposition, RedeliveryPolicy};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::bus::{Acknowledger, BusError, DeliverySource, QueueDelivery};
use crate::config::{Config, ProcessorConfig};
use crate::order::{OrderId, ProcessedRecord};
use crate::search::{SearchError, SearchIndex};
use crate::utils::retry::connection_backoff;

/// Errors that fail a single processing attempt.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("Invalid JSON: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Message has no orderId")]
    MissingOrderId,

    #[error("Index write failed: {0}")]
    Index(#[source] SearchError),

    #[error("Index write timed out after {0:?}")]
    IndexTimeout(Duration),
}

impl ProcessingError {
    /// State the failure occurred in.
    pub fn stage(&self) -> &'static str {
        match self {
            ProcessingError::Decode(_) => "decode",
            ProcessingError::MissingOrderId => "validate",
            ProcessingError::Index(_) | ProcessingError::IndexTimeout(_) => "index",
        }
    }
}

/// Processing state of one delivery.
#[derive(Debug)]
pub enum Step {
    Received(Vec<u8>),
    Decoded(Map<String, Value>),
    Validated(OrderId),
    Processed(OrderId),
    Indexed(OrderId),
    Failed(ProcessingError),
}

impl Step {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Step::Indexed(_) | Step::Failed(_))
    }
}

/// Received -> Decoded. The body must be a JSON object.
pub fn decode(body: &[u8]) -> Step {
    match serde_json::from_slice::<Map<String, Value>>(body) {
        Ok(message) => Step::Decoded(message),
        Err(e) => Step::Failed(ProcessingError::Decode(e)),
    }
}

/// Decoded -> Validated. `orderId` must be a non-empty string.
pub fn validate(message: &Map<String, Value>) -> Step {
    match message.get("orderId").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => Step::Validated(OrderId::new(id)),
        _ => Step::Failed(ProcessingError::MissingOrderId),
    }
}

/// Why [`OrderProcessor::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    Shutdown,
    /// The broker closed or broke the consumer.
    SourceClosed,
}

/// Consumes orders from the durable queue and records them in the index.
pub struct OrderProcessor {
    index: Arc<dyn SearchIndex>,
    work_duration: Duration,
    index_timeout: Duration,
    policy: RedeliveryPolicy,
}

impl OrderProcessor {
    pub fn new(index: Arc<dyn SearchIndex>, work_duration: Duration, index_timeout: Duration) -> Self {
        Self {
            index,
            work_duration,
            index_timeout,
            policy: RedeliveryPolicy::default(),
        }
    }

    pub fn from_config(index: Arc<dyn SearchIndex>, config: &Config) -> Self {
        let processor: &ProcessorConfig = &config.processor;
        Self::new(index, processor.work_duration(), config.search.timeout())
            .with_policy(RedeliveryPolicy::from_config(&processor.redelivery))
    }

    pub fn with_policy(mut self, policy: RedeliveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Make sure the target index exists. Must succeed before consuming.
    pub async fn prepare(&self) -> Result<(), SearchError> {
        self.index.ensure_index().await
    }

    /// Run `body` through the state machine without settling anything.
    pub async fn evaluate(&self, body: &[u8]) -> Result<OrderId, ProcessingError> {
        let mut step = Step::Received(body.to_vec());
        loop {
            step = match self.advance(step).await {
                Step::Indexed(order_id) => return Ok(order_id),
                Step::Failed(e) => return Err(e),
                next => next,
            };
        }
    }

    async fn advance(&self, step: Step) -> Step {
        match step {
            Step::Received(body) => decode(&body),
            Step::Decoded(message) => {
                debug!(message = ?message, "Processing order");
                validate(&message)
            }
            Step::Validated(order_id) => self.process(order_id).await,
            Step::Processed(order_id) => self.write_index(order_id).await,
            terminal => terminal,
        }
    }

    /// Validated -> Processed. Stands in for the business work.
    async fn process(&self, order_id: OrderId) -> Step {
        tokio::time::sleep(self.work_duration).await;
        Step::Processed(order_id)
    }

    /// Processed -> Indexed, under the index timeout.
    async fn write_index(&self, order_id: OrderId) -> Step {
        let record = ProcessedRecord::processed(order_id, Utc::now());
        match tokio::time::timeout(self.index_timeout, self.index.write(&record)).await {
            Ok(Ok(())) => Step::Indexed(record.order_id),
            Ok(Err(e)) => Step::Failed(ProcessingError::Index(e)),
            Err(_) => Step::Failed(ProcessingError::IndexTimeout(self.index_timeout)),
        }
    }

    /// Process one delivery and settle it with the broker.
    ///
    /// Settlement failures are logged, not retried; the broker's own
    /// unacknowledged-delivery handling decides the message's fate.
    pub async fn handle(&self, delivery: QueueDelivery) -> Disposition {
        let (_never, mut shutdown) = watch::channel(false);
        self.handle_until(delivery, &mut shutdown).await
    }

    /// Like [`handle`](Self::handle), but a requeue delay is cut short once
    /// `shutdown` flips to true.
    async fn handle_until(
        &self,
        delivery: QueueDelivery,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Disposition {
        let disposition = match self.evaluate(&delivery.body).await {
            Ok(order_id) => {
                info!(order_id = %order_id, "Order processed");
                Disposition::Ack
            }
            Err(e) => {
                let disposition = self.policy.on_failure(delivery.attempt);
                warn!(
                    stage = e.stage(),
                    error = %e,
                    payload = %String::from_utf8_lossy(&delivery.body),
                    attempt = ?delivery.attempt,
                    redelivered = delivery.redelivered,
                    disposition = ?disposition,
                    "Order processing failed"
                );
                disposition
            }
        };

        settle(delivery.acker.as_ref(), disposition, shutdown).await;
        disposition
    }

    /// Handle deliveries from `source` until shutdown or the source closes.
    ///
    /// Shutdown is checked between deliveries; an in-flight delivery is
    /// finished and settled first.
    pub async fn run<S>(&self, source: &mut S, shutdown: &mut watch::Receiver<bool>) -> RunExit
    where
        S: DeliverySource + ?Sized,
    {
        loop {
            if *shutdown.borrow() {
                info!("Processor stopping");
                return RunExit::Shutdown;
            }

            let next = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return RunExit::Shutdown;
                    }
                    continue;
                }
                next = source.next_delivery() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    self.handle_until(delivery, shutdown).await;
                }
                Some(Err(e)) => {
                    error!(error = %e, "Consumer failed");
                    return RunExit::SourceClosed;
                }
                None => {
                    warn!("Consumer closed by broker");
                    return RunExit::SourceClosed;
                }
            }
        }
    }

    /// Consume from sources produced by `connect`, reconnecting with
    /// backoff whenever one closes, until shutdown.
    ///
    /// Returns the connect error once reconnection attempts are exhausted.
    pub async fn consume_with_reconnect<F, Fut, S>(
        &self,
        mut connect: F,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), BusError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<S, BusError>>,
        S: DeliverySource,
    {
        loop {
            let connecting = (|| connect())
                .retry(connection_backoff())
                .notify(|e: &BusError, delay: Duration| {
                    warn!(error = %e, delay = ?delay, "Consumer connect failed, retrying");
                });

            let mut source = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => return Ok(()),
                source = connecting => source?,
            };

            match self.run(&mut source, &mut shutdown).await {
                RunExit::Shutdown => return Ok(()),
                RunExit::SourceClosed => info!("Reconnecting consumer"),
            }
        }
    }
}

async fn settle(
    acker: &dyn Acknowledger,
    disposition: Disposition,
    shutdown: &mut watch::Receiver<bool>,
) {
    let result = match disposition {
        Disposition::Ack => acker.ack().await,
        Disposition::Requeue { delay } => {
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.wait_for(|stop| *stop) => {
                        debug!(delay = ?delay, "Shutdown during requeue delay, requeueing now");
                    }
                }
            }
            acker.nack(true).await
        }
        Disposition::DeadLetter => acker.nack(false).await,
    };

    if let Err(e) = result {
        error!(error = %e, disposition = ?disposition, "Failed to settle delivery");
    }
}

#[cfg(test)]
mod tests;

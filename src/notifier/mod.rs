//! Notification fan-out consumer.
//!
//! Joins a competing-consumer group on the broadcast bus and records every
//! notification it receives. Payloads that are not a JSON object are
//! recorded raw.
//! Nothing is acknowledged: the broadcast bus is fire-and-forget.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{info, warn};

/// A message received from the broadcast bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastMessage {
    pub subject: String,
    pub payload: Bytes,
}

/// Outcome of decoding a received notification.
#[derive(Debug, Clone, PartialEq)]
pub enum ReceivedNotification {
    /// Payload was a JSON object.
    Decoded(Value),
    /// Payload was not a JSON object; kept as lossy UTF-8.
    Raw(String),
}

impl ReceivedNotification {
    pub fn decode(payload: &[u8]) -> Self {
        match serde_json::from_slice::<Map<String, Value>>(payload) {
            Ok(object) => Self::Decoded(Value::Object(object)),
            Err(_) => Self::Raw(String::from_utf8_lossy(payload).into_owned()),
        }
    }
}

/// Record one notification.
pub fn handle(message: &BroadcastMessage) -> ReceivedNotification {
    let received = ReceivedNotification::decode(&message.payload);
    match &received {
        ReceivedNotification::Decoded(event) => {
            info!(subject = %message.subject, event = %event, "Received notification");
        }
        ReceivedNotification::Raw(raw) => {
            warn!(subject = %message.subject, payload = %raw, "Received undecodable notification");
        }
    }
    received
}

/// Handle messages from `messages` until the stream ends or `shutdown`
/// flips to true. Returns the number of messages handled.
pub async fn run<S>(mut messages: S, mut shutdown: watch::Receiver<bool>) -> usize
where
    S: Stream<Item = BroadcastMessage> + Unpin,
{
    let mut handled = 0;
    loop {
        if *shutdown.borrow() {
            info!(handled, "Notifier stopping");
            return handled;
        }

        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() {
                    info!(handled, "Shutdown channel closed, notifier stopping");
                    return handled;
                }
            }
            next = messages.next() => match next {
                Some(message) => {
                    handle(&message);
                    handled += 1;
                }
                None => {
                    warn!(handled, "Notification subscription closed");
                    return handled;
                }
            },
        }
    }
}

//! In-memory broadcast bus and durable queue for testing.
//!
//! `InMemoryBroadcast` mirrors broadcast semantics: subject wildcards,
//! competing-consumer groups, and no retention for absent subscribers.
//! `InMemoryQueue` mirrors durable queue semantics: ready/unacked
//! accounting, prefetch-one delivery per consumer, requeue on nack, and
//! redelivery of unacknowledged messages when a consumer connection is lost.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use tokio::sync::{mpsc, Notify};

use super::{
    subject_matches, Acknowledger, BusError, DeliverySource, NotificationBus, QueueDelivery,
    QueueMessage, Result, WorkQueue,
};
use crate::notifier::BroadcastMessage;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Broadcast
// ============================================================================

struct Subscription {
    pattern: String,
    group: Option<String>,
    sender: mpsc::UnboundedSender<BroadcastMessage>,
}

#[derive(Default)]
struct BroadcastState {
    subscriptions: Vec<Subscription>,
    published: Vec<BroadcastMessage>,
    group_cursor: HashMap<String, usize>,
}

/// In-memory broadcast bus.
#[derive(Default)]
pub struct InMemoryBroadcast {
    state: Mutex<BroadcastState>,
    fail_on_publish: AtomicBool,
    publish_delay: Mutex<Option<Duration>>,
}

impl InMemoryBroadcast {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_on_publish(&self, fail: bool) {
        self.fail_on_publish.store(fail, Ordering::SeqCst);
    }

    /// Stall every publish for `delay` before it is accepted.
    pub fn set_publish_delay(&self, delay: Option<Duration>) {
        *lock(&self.publish_delay) = delay;
    }

    /// Subscribe to every message matching `pattern`.
    pub fn subscribe(&self, pattern: &str) -> InMemorySubscription {
        self.add_subscription(pattern, None)
    }

    /// Join competing-consumer `group` on `pattern`.
    ///
    /// Each matching message is delivered to one member of the group.
    pub fn queue_subscribe(&self, pattern: &str, group: &str) -> InMemorySubscription {
        self.add_subscription(pattern, Some(group.to_string()))
    }

    fn add_subscription(&self, pattern: &str, group: Option<String>) -> InMemorySubscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        lock(&self.state).subscriptions.push(Subscription {
            pattern: pattern.to_string(),
            group,
            sender,
        });
        InMemorySubscription { receiver }
    }

    /// Every message accepted by `publish`, in order.
    pub fn published(&self) -> Vec<BroadcastMessage> {
        lock(&self.state).published.clone()
    }

    pub fn published_count(&self) -> usize {
        lock(&self.state).published.len()
    }
}

#[async_trait]
impl NotificationBus for InMemoryBroadcast {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        let delay = *lock(&self.publish_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_on_publish.load(Ordering::SeqCst) {
            return Err(BusError::Connection("Mock publish failure".to_string()));
        }

        let message = BroadcastMessage {
            subject: subject.to_string(),
            payload,
        };

        let mut state = lock(&self.state);
        state.subscriptions.retain(|s| !s.sender.is_closed());
        state.published.push(message.clone());

        let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, sub) in state.subscriptions.iter().enumerate() {
            if !subject_matches(&sub.pattern, subject) {
                continue;
            }
            match &sub.group {
                Some(group) => groups.entry(group.clone()).or_default().push(idx),
                None => {
                    let _ = sub.sender.send(message.clone());
                }
            }
        }

        for (group, members) in groups {
            let cursor = state.group_cursor.entry(group).or_insert(0);
            let chosen = members[*cursor % members.len()];
            *cursor = cursor.wrapping_add(1);
            let _ = state.subscriptions[chosen].sender.send(message.clone());
        }

        Ok(())
    }
}

/// Receiving end of an in-memory subscription.
pub struct InMemorySubscription {
    receiver: mpsc::UnboundedReceiver<BroadcastMessage>,
}

impl InMemorySubscription {
    /// Take an already delivered message without waiting.
    pub fn try_next(&mut self) -> Option<BroadcastMessage> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for InMemorySubscription {
    type Item = BroadcastMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

// ============================================================================
// Durable queue
// ============================================================================

#[derive(Debug, Clone)]
struct StoredMessage {
    message: QueueMessage,
    delivery_count: u32,
}

struct Unacked {
    stored: StoredMessage,
    consumer: u64,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, Unacked>,
    /// consumer id -> outstanding delivery tag (prefetch of one)
    outstanding: HashMap<u64, u64>,
    dead_lettered: Vec<QueueMessage>,
    acked: usize,
    next_tag: u64,
    closed: bool,
}

struct QueueShared {
    state: Mutex<QueueState>,
    notify: Notify,
}

/// In-memory durable work queue.
pub struct InMemoryQueue {
    shared: Arc<QueueShared>,
    next_consumer: AtomicU64,
    fail_on_publish: AtomicBool,
    publish_delay: Mutex<Option<Duration>>,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self {
            shared: Arc::new(QueueShared {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
            }),
            next_consumer: AtomicU64::new(1),
            fail_on_publish: AtomicBool::new(false),
            publish_delay: Mutex::new(None),
        }
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_on_publish(&self, fail: bool) {
        self.fail_on_publish.store(fail, Ordering::SeqCst);
    }

    /// Delay every publish before the broker accepts it.
    pub fn set_publish_delay(&self, delay: Option<Duration>) {
        *lock(&self.publish_delay) = delay;
    }

    /// Start a manual-ack consumer with a prefetch of one.
    pub fn consume(&self) -> InMemoryConsumer {
        InMemoryConsumer {
            shared: Arc::clone(&self.shared),
            id: self.next_consumer.fetch_add(1, Ordering::SeqCst),
        }
    }

    /// Messages held by the queue: ready plus delivered-but-unacknowledged.
    pub fn depth(&self) -> usize {
        let state = lock(&self.shared.state);
        state.ready.len() + state.unacked.len()
    }

    pub fn ready_count(&self) -> usize {
        lock(&self.shared.state).ready.len()
    }

    pub fn unacked_count(&self) -> usize {
        lock(&self.shared.state).unacked.len()
    }

    pub fn acked_count(&self) -> usize {
        lock(&self.shared.state).acked
    }

    /// Bodies of ready messages in delivery order.
    pub fn ready_bodies(&self) -> Vec<Vec<u8>> {
        lock(&self.shared.state)
            .ready
            .iter()
            .map(|m| m.message.body.clone())
            .collect()
    }

    /// Messages rejected without requeue.
    pub fn dead_lettered(&self) -> Vec<QueueMessage> {
        lock(&self.shared.state).dead_lettered.clone()
    }

    /// Return every unacknowledged message to the head of the queue, as the
    /// broker does when a consumer's connection drops.
    pub fn recover_unacked(&self) {
        {
            let mut state = lock(&self.shared.state);
            let mut recovered: Vec<(u64, StoredMessage)> = state
                .unacked
                .drain()
                .map(|(tag, u)| (tag, u.stored))
                .collect();
            recovered.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
            for (_, stored) in recovered {
                state.ready.push_front(stored);
            }
            state.outstanding.clear();
        }
        self.shared.notify.notify_waiters();
    }

    /// Cancel all consumers; pending `next_delivery` calls return `None`.
    pub fn close(&self) {
        lock(&self.shared.state).closed = true;
        self.shared.notify.notify_waiters();
    }
}

#[async_trait]
impl WorkQueue for InMemoryQueue {
    async fn publish(&self, message: QueueMessage) -> Result<()> {
        let delay = *lock(&self.publish_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_on_publish.load(Ordering::SeqCst) {
            return Err(BusError::Connection("Mock publish failure".to_string()));
        }

        lock(&self.shared.state).ready.push_back(StoredMessage {
            message,
            delivery_count: 0,
        });
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

/// Manual-ack consumer over an `InMemoryQueue`.
pub struct InMemoryConsumer {
    shared: Arc<QueueShared>,
    id: u64,
}

impl InMemoryConsumer {
    fn try_take(&self) -> Option<Option<QueueDelivery>> {
        let mut state = lock(&self.shared.state);
        if state.closed {
            return Some(None);
        }
        if state.outstanding.contains_key(&self.id) {
            return None;
        }
        let mut stored = state.ready.pop_front()?;
        stored.delivery_count += 1;

        state.next_tag += 1;
        let tag = state.next_tag;
        state.outstanding.insert(self.id, tag);
        state.unacked.insert(
            tag,
            Unacked {
                stored: stored.clone(),
                consumer: self.id,
            },
        );

        Some(Some(QueueDelivery {
            body: stored.message.body,
            redelivered: stored.delivery_count > 1,
            attempt: Some(stored.delivery_count),
            acker: Box::new(InMemoryAcker {
                shared: Arc::clone(&self.shared),
                tag,
            }),
        }))
    }
}

#[async_trait]
impl DeliverySource for InMemoryConsumer {
    async fn next_delivery(&mut self) -> Option<Result<QueueDelivery>> {
        loop {
            let notified = self.shared.notify.notified();
            if let Some(taken) = self.try_take() {
                return taken.map(Ok);
            }
            notified.await;
        }
    }
}

struct InMemoryAcker {
    shared: Arc<QueueShared>,
    tag: u64,
}

impl InMemoryAcker {
    /// Remove the delivery from the unacked set and free the consumer's
    /// prefetch slot.
    fn settle(&self, state: &mut QueueState) -> Result<StoredMessage> {
        let unacked = state.unacked.remove(&self.tag).ok_or_else(|| {
            BusError::Acknowledge(format!("unknown delivery tag {}", self.tag))
        })?;
        state.outstanding.remove(&unacked.consumer);
        Ok(unacked.stored)
    }
}

#[async_trait]
impl Acknowledger for InMemoryAcker {
    async fn ack(&self) -> Result<()> {
        {
            let mut state = lock(&self.shared.state);
            self.settle(&mut state)?;
            state.acked += 1;
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        {
            let mut state = lock(&self.shared.state);
            let stored = self.settle(&mut state)?;
            if requeue {
                state.ready.push_front(stored);
            } else {
                state.dead_lettered.push(stored.message);
            }
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

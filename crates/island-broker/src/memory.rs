//! In-memory broker implementing the channel contracts.
//!
//! Used by the integration tests and local development. Honours the queue
//! semantics the engine depends on: per-message TTL checked at dispatch
//! time, `x-expires` reaping of idle queues, exclusive queues bound to their
//! declaring channel, round-robin dispatch with prefetch, and ack/nack with
//! requeue-and-redeliver.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use island_proto::MessageHeaders;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::error::BrokerError;
use crate::traits::{Channel, ChannelPool, Subscription};
use crate::types::{Delivery, PublishOptions, QueueOptions};

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    correlation_id: Option<String>,
    reply_to: Option<String>,
    headers: MessageHeaders,
    timestamp: Option<u64>,
    expiration: Option<Duration>,
    published_at: Instant,
    redelivered: bool,
}

#[derive(Debug)]
struct ConsumerEntry {
    tag: String,
    channel_id: u64,
    prefetch: u16,
    outstanding: usize,
    sender: mpsc::UnboundedSender<Delivery>,
}

#[derive(Debug)]
struct QueueState {
    owner: Option<u64>,
    expires: Option<Duration>,
    backlog: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerEntry>,
    rr_cursor: usize,
    idle_since: Option<Instant>,
}

#[derive(Debug)]
struct UnackedEntry {
    queue: String,
    consumer_tag: String,
    channel_id: u64,
    message: StoredMessage,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    unacked: HashMap<u64, UnackedEntry>,
    next_delivery_tag: u64,
    next_consumer_id: u64,
}

impl BrokerState {
    /// Removes queues that have sat without consumers past their expiry.
    fn reap_expired(&mut self) {
        let now = Instant::now();
        self.queues.retain(|_, q| {
            !(q.consumers.is_empty()
                && matches!((q.expires, q.idle_since), (Some(exp), Some(idle))
                    if now.duration_since(idle) >= exp))
        });
    }

    /// Moves backlog messages to eligible consumers.
    fn dispatch(&mut self, queue_name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            if queue.backlog.is_empty() {
                return;
            }
            queue.consumers.retain(|c| !c.sender.is_closed());
            let len = queue.consumers.len();
            if len == 0 {
                if queue.idle_since.is_none() {
                    queue.idle_since = Some(Instant::now());
                }
                return;
            }

            let mut chosen = None;
            for offset in 0..len {
                let idx = (queue.rr_cursor + offset) % len;
                let consumer = &queue.consumers[idx];
                if consumer.prefetch == 0 || consumer.outstanding < consumer.prefetch as usize {
                    chosen = Some(idx);
                    break;
                }
            }
            let Some(idx) = chosen else {
                return;
            };

            let Some(message) = queue.backlog.pop_front() else {
                return;
            };
            if let Some(expiration) = message.expiration {
                if message.published_at.elapsed() >= expiration {
                    debug!(queue = queue_name, "dropping expired message");
                    continue;
                }
            }

            self.next_delivery_tag += 1;
            let delivery_tag = self.next_delivery_tag;
            let consumer = &mut queue.consumers[idx];
            let delivery = Delivery {
                delivery_tag,
                body: message.body.clone(),
                correlation_id: message.correlation_id.clone(),
                reply_to: message.reply_to.clone(),
                headers: message.headers.clone(),
                timestamp: message.timestamp,
                redelivered: message.redelivered,
            };
            if consumer.sender.send(delivery).is_err() {
                queue.backlog.push_front(message);
                queue.consumers.remove(idx);
                continue;
            }
            consumer.outstanding += 1;
            let consumer_tag = consumer.tag.clone();
            let channel_id = consumer.channel_id;
            queue.rr_cursor = (idx + 1) % len;
            self.unacked.insert(
                delivery_tag,
                UnackedEntry {
                    queue: queue_name.to_owned(),
                    consumer_tag,
                    channel_id,
                    message,
                },
            );
        }
    }

    /// Resolves an unacked delivery: removed on ack or nack-discard,
    /// pushed back and redelivered on nack-requeue.
    fn settle(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let entry = self
            .unacked
            .remove(&delivery_tag)
            .ok_or(BrokerError::DeliveryNotFound(delivery_tag))?;
        let queue_name = entry.queue.clone();
        if let Some(queue) = self.queues.get_mut(&queue_name) {
            if let Some(consumer) = queue
                .consumers
                .iter_mut()
                .find(|c| c.tag == entry.consumer_tag)
            {
                consumer.outstanding = consumer.outstanding.saturating_sub(1);
            }
            if requeue {
                let mut message = entry.message;
                message.redelivered = true;
                queue.backlog.push_front(message);
            }
        }
        self.dispatch(&queue_name);
        Ok(())
    }

    fn cancel(&mut self, tag: &str) -> Result<(), BrokerError> {
        for queue in self.queues.values_mut() {
            if let Some(pos) = queue.consumers.iter().position(|c| c.tag == tag) {
                queue.consumers.remove(pos);
                queue.rr_cursor = 0;
                if queue.consumers.is_empty() {
                    queue.idle_since = Some(Instant::now());
                }
                return Ok(());
            }
        }
        Err(BrokerError::ConsumerNotFound(tag.to_owned()))
    }

    fn close_channel(&mut self, channel_id: u64) {
        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, e)| e.channel_id == channel_id)
            .map(|(tag, _)| *tag)
            .collect();
        let mut touched = Vec::new();
        for tag in tags {
            if let Some(entry) = self.unacked.remove(&tag) {
                if let Some(queue) = self.queues.get_mut(&entry.queue) {
                    let mut message = entry.message;
                    message.redelivered = true;
                    queue.backlog.push_front(message);
                    touched.push(entry.queue);
                }
            }
        }

        self.queues.retain(|_, q| q.owner != Some(channel_id));
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.channel_id != channel_id);
            if queue.consumers.is_empty() && queue.idle_since.is_none() {
                queue.idle_since = Some(Instant::now());
            }
        }

        for name in touched {
            self.dispatch(&name);
        }
    }
}

/// The shared in-memory broker. Cloning yields a handle to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    next_channel_id: Arc<AtomicU64>,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new channel on this broker.
    #[must_use]
    pub fn channel(&self) -> MemoryChannel {
        MemoryChannel {
            id: self.next_channel_id.fetch_add(1, Ordering::Relaxed),
            state: self.state.clone(),
            prefetch: AtomicU16::new(0),
        }
    }

    /// Whether a queue currently exists (expired queues are reaped first).
    pub async fn queue_exists(&self, queue: &str) -> bool {
        let mut state = self.state.lock().await;
        state.reap_expired();
        state.queues.contains_key(queue)
    }

    /// Number of messages sitting in a queue's backlog, if it exists.
    pub async fn queue_depth(&self, queue: &str) -> Option<usize> {
        let state = self.state.lock().await;
        state.queues.get(queue).map(|q| q.backlog.len())
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker").finish_non_exhaustive()
    }
}

/// A channel on the in-memory broker.
pub struct MemoryChannel {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
    prefetch: AtomicU16,
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn assert_queue(&self, queue: &str, options: QueueOptions) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.reap_expired();
        match state.queues.get_mut(queue) {
            Some(existing) => {
                if let Some(owner) = existing.owner {
                    if owner != self.id {
                        return Err(BrokerError::QueueLocked(queue.to_owned()));
                    }
                }
                if existing.consumers.is_empty() {
                    existing.idle_since = Some(Instant::now());
                }
                Ok(())
            }
            None => {
                state.queues.insert(
                    queue.to_owned(),
                    QueueState {
                        owner: options.exclusive.then_some(self.id),
                        expires: options.expires,
                        backlog: VecDeque::new(),
                        consumers: Vec::new(),
                        rr_cursor: 0,
                        idle_since: Some(Instant::now()),
                    },
                );
                Ok(())
            }
        }
    }

    async fn prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.prefetch.store(count, Ordering::Relaxed);
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Subscription, BrokerError> {
        let mut state = self.state.lock().await;
        state.reap_expired();
        state.next_consumer_id += 1;
        let tag = format!("ctag-{}.{}", self.id, state.next_consumer_id);

        let channel_id = self.id;
        let prefetch = self.prefetch.load(Ordering::Relaxed);
        let queue_state = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_owned()))?;
        if let Some(owner) = queue_state.owner {
            if owner != channel_id {
                return Err(BrokerError::QueueLocked(queue.to_owned()));
            }
        }

        let (sender, deliveries) = mpsc::unbounded_channel();
        queue_state.consumers.push(ConsumerEntry {
            tag: tag.clone(),
            channel_id,
            prefetch,
            outstanding: 0,
            sender,
        });
        queue_state.idle_since = None;
        state.dispatch(queue);

        Ok(Subscription { tag, deliveries })
    }

    async fn cancel(&self, tag: &str) -> Result<(), BrokerError> {
        self.state.lock().await.cancel(tag)
    }

    async fn send_to_queue(
        &self,
        queue: &str,
        body: &[u8],
        options: PublishOptions,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.reap_expired();
        let Some(queue_state) = state.queues.get_mut(queue) else {
            debug!(queue, "message dropped: queue does not exist");
            return Ok(());
        };
        queue_state.backlog.push_back(StoredMessage {
            body: body.to_vec(),
            correlation_id: options.correlation_id,
            reply_to: options.reply_to,
            headers: options.headers,
            timestamp: options.timestamp,
            expiration: options.expiration,
            published_at: Instant::now(),
            redelivered: false,
        });
        state.dispatch(queue);
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.state.lock().await.settle(delivery_tag, false)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.state.lock().await.settle(delivery_tag, requeue)
    }

    async fn close(&self) {
        self.state.lock().await.close_channel(self.id);
    }
}

impl std::fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Channel pool over [`MemoryBroker`]: every acquire opens a fresh channel,
/// release closes it.
#[derive(Clone, Debug)]
pub struct MemoryChannelPool {
    broker: MemoryBroker,
}

impl MemoryChannelPool {
    #[must_use]
    pub fn new(broker: MemoryBroker) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl ChannelPool for MemoryChannelPool {
    async fn acquire(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        Ok(Arc::new(self.broker.channel()))
    }

    async fn release(&self, channel: Arc<dyn Channel>) {
        channel.close().await;
    }
}

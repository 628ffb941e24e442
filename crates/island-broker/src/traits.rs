//! Contracts the RPC engine consumes from the broker client.
//!
//! These mirror the AMQP 0-9-1 operations the engine relies on: queue
//! declaration, consume/cancel, publish to the default exchange
//! (`send_to_queue`), per-message ack/nack, and per-channel prefetch. The
//! real client and its reconnection logic live behind these traits; the
//! engine assumes best-effort publish.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::error::BrokerError;
use crate::types::{Delivery, PublishOptions, QueueOptions};

/// An active consumer: its broker-assigned tag plus the delivery stream.
pub struct Subscription {
    pub tag: String,
    pub deliveries: UnboundedReceiver<Delivery>,
}

/// A broker channel.
///
/// One channel is borrowed per long-lived consumer; publishes use a
/// short-lived channel released on completion.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Declares a queue, creating it if absent.
    async fn assert_queue(&self, queue: &str, options: QueueOptions) -> Result<(), BrokerError>;

    /// Sets the per-channel prefetch applied to subsequent consumers.
    /// Zero means unlimited.
    async fn prefetch(&self, count: u16) -> Result<(), BrokerError>;

    /// Starts consuming from a queue.
    async fn consume(&self, queue: &str) -> Result<Subscription, BrokerError>;

    /// Cancels a consumer; the broker stops dispatching to it.
    async fn cancel(&self, tag: &str) -> Result<(), BrokerError>;

    /// Publishes a message to a queue via the default exchange.
    async fn send_to_queue(
        &self,
        queue: &str,
        body: &[u8],
        options: PublishOptions,
    ) -> Result<(), BrokerError>;

    /// Acknowledges a delivery.
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Rejects a delivery, optionally requeueing it for redelivery.
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    /// Closes the channel: cancels its consumers, requeues its unacked
    /// deliveries and deletes its exclusive queues.
    async fn close(&self);
}

/// Hands out broker channels.
///
/// The pool owns reconnection; a channel acquired here is usable until
/// released. Long-lived consumers hold a channel for their lifetime, while
/// one-shot publishes should acquire, publish and release.
#[async_trait]
pub trait ChannelPool: Send + Sync {
    async fn acquire(&self) -> Result<Arc<dyn Channel>, BrokerError>;

    async fn release(&self, channel: Arc<dyn Channel>);
}

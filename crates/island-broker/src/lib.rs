//! Broker contracts for the island RPC engine.
//!
//! The engine talks to the message broker exclusively through the
//! [`Channel`] and [`ChannelPool`] traits, which mirror the AMQP 0-9-1
//! operations it needs. A production deployment plugs a real client in
//! behind them; [`MemoryBroker`] provides the same semantics in-process for
//! development and tests.

mod error;
pub mod memory;
mod traits;
mod types;

pub use error::BrokerError;
pub use memory::{MemoryBroker, MemoryChannel, MemoryChannelPool};
pub use traits::{Channel, ChannelPool, Subscription};
pub use types::{unix_millis_now, Delivery, PublishOptions, QueueOptions};

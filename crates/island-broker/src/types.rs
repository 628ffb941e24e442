//! Message and queue types shared by broker implementations.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use island_proto::MessageHeaders;

/// Options for queue declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[must_use]
pub struct QueueOptions {
    /// Survive broker restarts. The engine declares everything non-durable.
    pub durable: bool,
    /// Restrict the queue to the declaring channel and delete it when that
    /// channel closes.
    pub exclusive: bool,
    /// Server-side idle expiry (`x-expires`): the queue is deleted after
    /// sitting without consumers for this long.
    pub expires: Option<Duration>,
}

impl QueueOptions {
    pub fn exclusive() -> Self {
        Self {
            exclusive: true,
            ..Self::default()
        }
    }

    pub fn expiring(expires: Duration) -> Self {
        Self {
            expires: Some(expires),
            ..Self::default()
        }
    }
}

/// Message properties supplied on publish.
#[derive(Debug, Clone, Default)]
#[must_use]
pub struct PublishOptions {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Per-message TTL: the broker drops the message if it cannot be
    /// delivered within this window.
    pub expiration: Option<Duration>,
    /// Publish time, milliseconds since the Unix epoch.
    pub timestamp: Option<u64>,
    pub headers: MessageHeaders,
}

impl PublishOptions {
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_headers(mut self, headers: MessageHeaders) -> Self {
        self.headers = headers;
        self
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Broker-assigned tag used for ack/nack.
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub headers: MessageHeaders,
    /// Publish time, milliseconds since the Unix epoch.
    pub timestamp: Option<u64>,
    /// Whether this message was delivered before and requeued.
    pub redelivered: bool,
}

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn unix_millis_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Queue locked to another channel: {0}")]
    QueueLocked(String),

    #[error("Consumer not found: {0}")]
    ConsumerNotFound(String),

    #[error("Delivery not found: {0}")]
    DeliveryNotFound(u64),

    #[error("Channel closed")]
    ChannelClosed,
}

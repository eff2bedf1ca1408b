//! Broker error types

use thiserror::Error;

/// Error type for stream broker operations
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Channel or connection closed
    #[error("channel closed")]
    ChannelClosed,

    /// Subscriber fell behind the broadcast buffer
    #[error("receiver lagged by {0} messages")]
    Lagged(u64),

    /// Connection error (Redis)
    #[error("connection error: {0}")]
    Connection(String),

    /// Stream operation error
    #[error("stream error: {0}")]
    Stream(String),

    /// Consumer group error
    #[error("consumer group error: {0}")]
    ConsumerGroup(String),

    /// Payload could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl BrokerError {
    /// Whether the caller may retry the operation
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Connection(_) | BrokerError::Lagged(_))
    }
}

impl From<tokio::sync::broadcast::error::RecvError> for BrokerError {
    fn from(err: tokio::sync::broadcast::error::RecvError) -> Self {
        match err {
            tokio::sync::broadcast::error::RecvError::Closed => BrokerError::ChannelClosed,
            tokio::sync::broadcast::error::RecvError::Lagged(n) => BrokerError::Lagged(n),
        }
    }
}

impl From<deadpool_redis::PoolError> for BrokerError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        BrokerError::Connection(err.to_string())
    }
}

impl From<deadpool_redis::redis::RedisError> for BrokerError {
    fn from(err: deadpool_redis::redis::RedisError) -> Self {
        BrokerError::Stream(err.to_string())
    }
}

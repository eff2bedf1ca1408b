//! Realtime fabric
//!
//! The connection lifecycle manager, the channel/subscription router and
//! the health monitor. Together with the queue these implement the
//! backpressure-aware, tenant-isolated event plane.

pub mod connection;
pub mod event;
pub mod health;
pub mod reconnect;
pub mod router;

use thiserror::Error;

pub use connection::{
    ConnectionManager, ConnectionSnapshot, ConnectionStats, HeartbeatResult, ReconnectTransport,
    RegisterSession, SnapshotSource,
};
pub use event::{ChannelType, Event};
pub use health::{Alert, AlertSeverity, AlertType, HealthMetrics, HealthMonitor, HealthTrend};
pub use reconnect::{ReconnectPolicy, SystemSnapshot};
pub use router::{EventRouter, PublishOptions, Subscription};

use crate::auth::AuthError;
use crate::broker::BrokerError;
use crate::queue::QueueError;
use crate::store::StoreError;

/// Error type for the realtime components
#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("invalid channel: {0}")]
    InvalidChannel(String),

    #[error("transport unavailable for session {0}")]
    TransportUnavailable(String),

    #[error("outbound queue full for session {session_id} on {channel}")]
    Backpressure { session_id: String, channel: String },

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

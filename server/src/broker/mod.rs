//! Stream broker adapter
//!
//! Redis-like streams with consumer groups plus pub/sub fan-out, behind a
//! pluggable backend:
//! - In-memory (default) - local-only, for development and tests
//! - Redis (optional) - distributed, for multi-node deployments
//!
//! Stream ids are monotonic per stream; consumer groups track pending
//! entries until acknowledged, which is what gives the queue layer its
//! at-least-once delivery.
//!
//! ## Key layout
//!
//! - Queues: `apix:queue:<name>`, dead letters: `apix:dlq:<name>`
//! - Event fan-out: `apix:events:<organization_id>:<channel>`
//! - Lifecycle: `apix:events:<organization_id>:connection_events`

mod error;
mod memory;
mod redis;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

pub use error::BrokerError;
use memory::MemoryBroker;
use redis::RedisBroker;

use crate::core::config::{BrokerBackendType, BrokerConfig};

/// Lifecycle topic suffix under `apix:events:<org>:`
pub const CONNECTION_EVENTS_CHANNEL: &str = "connection_events";

/// Stream key for a logical queue
pub fn queue_stream(name: &str) -> String {
    format!("apix:queue:{name}")
}

/// Stream key for a dead-letter queue
pub fn dlq_stream(name: &str) -> String {
    format!("apix:dlq:{name}")
}

/// Pub/sub topic for tenant-scoped event fan-out
pub fn events_topic(organization_id: &str, channel: &str) -> String {
    format!("apix:events:{organization_id}:{channel}")
}

// =============================================================================
// TYPES
// =============================================================================

/// Entry read from a stream, with its id for acknowledgment
#[derive(Debug, Clone)]
pub struct StreamEntry {
    /// Monotonic per-stream id
    pub id: String,
    /// Field-value pairs stored with the entry
    pub fields: HashMap<String, Vec<u8>>,
}

impl StreamEntry {
    /// Convenience accessor for the conventional `payload` field
    pub fn payload(&self) -> Option<&[u8]> {
        self.fields.get("payload").map(|v| v.as_slice())
    }
}

/// Subscription to a pub/sub topic
pub struct TopicSubscription {
    /// Stream of received payloads
    pub receiver: Pin<Box<dyn Stream<Item = Result<Vec<u8>, BrokerError>> + Send>>,
}

// =============================================================================
// STREAM BROKER TRAIT
// =============================================================================

/// Stream broker backend
#[async_trait]
pub trait StreamBroker: Send + Sync {
    /// Append an entry; returns its id
    async fn xadd(
        &self,
        stream: &str,
        fields: Vec<(String, Vec<u8>)>,
    ) -> Result<String, BrokerError>;

    /// Read entries with id greater than `from_id` (no consumer group)
    async fn xread(
        &self,
        stream: &str,
        from_id: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError>;

    /// Read new entries on behalf of a consumer group, blocking up to
    /// `block_ms`; zero reads without blocking. A timeout yields an empty
    /// batch, not an error. Delivered entries stay pending until
    /// acknowledged.
    async fn xread_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>, BrokerError>;

    /// Acknowledge a pending entry
    async fn xack(&self, stream: &str, group: &str, id: &str) -> Result<(), BrokerError>;

    /// Claim pending entries idle longer than `min_idle_ms` (crash recovery)
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError>;

    /// Number of entries in the stream
    async fn xlen(&self, stream: &str) -> Result<u64, BrokerError>;

    /// Create a consumer group; "already exists" is not an error
    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
    ) -> Result<(), BrokerError>;

    /// Publish to a pub/sub topic (fire-and-forget)
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BrokerError>;

    /// Subscribe to a pub/sub topic
    async fn subscribe(&self, topic: &str) -> Result<TopicSubscription, BrokerError>;

    /// Drop a stream entirely; consumer groups must be re-created
    async fn del(&self, stream: &str) -> Result<(), BrokerError>;

    /// Health check (validates connection)
    async fn health_check(&self) -> Result<(), BrokerError>;

    /// Backend name for debugging/logging
    fn backend_name(&self) -> &'static str;

    /// Release backend resources; called once during shutdown
    async fn close(&self) {}
}

// =============================================================================
// BROKER SERVICE
// =============================================================================

/// Central handle to the configured broker backend
#[derive(Clone)]
pub struct Broker {
    backend: Arc<dyn StreamBroker>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker").finish_non_exhaustive()
    }
}

impl Broker {
    /// Create from configuration
    pub async fn from_config(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let backend: Arc<dyn StreamBroker> = match config.backend {
            BrokerBackendType::Memory => Arc::new(MemoryBroker::new()),
            BrokerBackendType::Redis => {
                let url = config.redis_url.as_ref().ok_or_else(|| {
                    BrokerError::Config("redis_url required for Redis backend".into())
                })?;
                Arc::new(RedisBroker::new(url).await?)
            }
        };
        Ok(Self { backend })
    }

    /// In-memory broker for tests and single-process development
    pub fn in_memory() -> Self {
        Self {
            backend: Arc::new(MemoryBroker::new()),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }
}

impl std::ops::Deref for Broker {
    type Target = dyn StreamBroker;

    fn deref(&self) -> &Self::Target {
        self.backend.as_ref()
    }
}

//! Durable message queue over the stream broker
//!
//! Logical queues `high-priority`, `normal-priority`, `low-priority`,
//! `delayed`, `retry` and per-queue dead-letter streams, all sharing one
//! consumer group. Delivery is at-least-once: entries stay pending until
//! acknowledged, worker crashes are recovered through claims.
//!
//! ## Routing
//!
//! `delay > 0` routes to `delayed` (with a due-time field); otherwise
//! `priority > 5` to high, `priority < 0` to low, the rest to normal.
//!
//! ## Delayed delivery
//!
//! The delayed and retry streams are the durable due-time index. Sweepers
//! read entries into an in-process index but leave them pending in the
//! consumer group until promoted to their target stream, so a restart
//! recovers them by claiming idle pending entries. Failed messages back
//! off with `min(base * 2^(attempts-1), max)` and re-enter through the
//! retry stream; crossing `max_attempts` dead-letters them instead.

pub mod message;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub use message::{QueueMessage, QueueName};

use crate::broker::{Broker, BrokerError, StreamEntry};
use crate::core::config::{BackoffMode, QueueSettings};
use crate::core::constants::{DLQ_REPROCESS_BATCH, QUEUE_SWEEP_TICK_MS};

/// How often sweepers claim stuck entries from dead peers
const SWEEP_CLAIM_EVERY: u32 = 240;

/// Idle threshold before a sweeper steals a peer's pending entry
const SWEEP_CLAIM_IDLE_MS: u64 = 60_000;

// =============================================================================
// Errors
// =============================================================================

/// Error type for queue operations
#[derive(Error, Debug)]
pub enum QueueError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Malformed stream entry or payload
    #[error("parse error: {0}")]
    Parse(String),

    /// Handler rejected the message
    #[error("handler error: {0}")]
    Handler(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl QueueError {
    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }
}

// =============================================================================
// Handler
// =============================================================================

/// Consumes messages from a queue
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &QueueMessage) -> Result<(), QueueError>;
}

// =============================================================================
// Message queue
// =============================================================================

/// Priority/delay/retry/DLQ message queue
#[derive(Clone)]
pub struct MessageQueue {
    broker: Broker,
    settings: QueueSettings,
    consumer_name: String,
}

impl MessageQueue {
    pub fn new(broker: Broker, settings: QueueSettings) -> Self {
        let consumer_name = settings
            .consumer_name
            .clone()
            .unwrap_or_else(|| format!("{}:{}", uuid::Uuid::new_v4(), std::process::id()));
        Self {
            broker,
            settings,
            consumer_name,
        }
    }

    /// Idempotently create consumer groups for every stream this queue uses
    pub async fn init(&self) -> Result<(), QueueError> {
        let group = &self.settings.consumer_group;
        for queue in [
            QueueName::High,
            QueueName::Normal,
            QueueName::Low,
            QueueName::Delayed,
            QueueName::Retry,
        ] {
            self.broker.create_group(&queue.stream(), group, "0").await?;
        }
        for queue in QueueName::priority_queues() {
            self.broker
                .create_group(&queue.dlq_stream(), group, "0")
                .await?;
        }
        Ok(())
    }

    /// Where a message belongs given its priority and delay
    pub fn route(priority: i32, delay_ms: Option<u64>) -> QueueName {
        match delay_ms {
            Some(d) if d > 0 => QueueName::Delayed,
            _ if priority > 5 => QueueName::High,
            _ if priority < 0 => QueueName::Low,
            _ => QueueName::Normal,
        }
    }

    /// Target priority stream for a message once any delay has elapsed
    fn priority_route(priority: i32) -> QueueName {
        match priority {
            p if p > 5 => QueueName::High,
            p if p < 0 => QueueName::Low,
            _ => QueueName::Normal,
        }
    }

    /// Backoff before retry number `attempts + 1`
    pub fn backoff_delay(&self, attempts: u32) -> u64 {
        match self.settings.backoff_mode {
            BackoffMode::Fixed => self.settings.backoff_delay_ms,
            BackoffMode::Exponential => {
                let exp = attempts.saturating_sub(1).min(31);
                self.settings
                    .backoff_delay_ms
                    .saturating_mul(1u64 << exp)
                    .min(self.settings.max_backoff_ms)
            }
        }
    }

    /// Enqueue a message; returns its stream id
    pub async fn enqueue(&self, mut message: QueueMessage) -> Result<String, QueueError> {
        if message.max_attempts == 0 {
            message.max_attempts = self.settings.max_attempts;
        }
        let queue = Self::route(message.priority, message.delay_ms);
        let payload = message.to_bytes()?;

        let fields = match queue {
            QueueName::Delayed => {
                let delay = message.delay_ms.unwrap_or(0);
                let not_before = Utc::now().timestamp_millis() as u64 + delay;
                let target = Self::priority_route(message.priority);
                vec![
                    ("payload".to_string(), payload),
                    ("not_before".to_string(), not_before.to_string().into_bytes()),
                    ("target".to_string(), target.as_str().as_bytes().to_vec()),
                ]
            }
            _ => vec![("payload".to_string(), payload)],
        };

        let id = self.broker.xadd(&queue.stream(), fields).await?;
        tracing::trace!(queue = %queue, id = %id, message_type = %message.message_type, "Enqueued");
        Ok(id)
    }

    /// Manually acknowledge an entry (for `auto_ack = false` consumers)
    pub async fn ack(&self, queue: QueueName, id: &str) -> Result<(), QueueError> {
        self.broker
            .xack(&queue.stream(), &self.settings.consumer_group, id)
            .await?;
        Ok(())
    }

    /// Spawn the worker pool for one queue
    pub fn start_workers(
        &self,
        queue: QueueName,
        handler: Arc<dyn MessageHandler>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        (0..self.settings.concurrency.max(1))
            .map(|worker| {
                let this = self.clone();
                let handler = Arc::clone(&handler);
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    tracing::debug!(queue = %queue, worker, "Queue worker started");
                    loop {
                        if *shutdown.borrow() {
                            break;
                        }
                        let stream_name = queue.stream();
                        tokio::select! {
                            _ = shutdown.changed() => break,
                            batch = this.broker.xread_group(
                                &stream_name,
                                &this.settings.consumer_group,
                                &this.consumer_name,
                                this.settings.batch_size,
                                this.settings.block_ms,
                            ) => match batch {
                                Ok(entries) => {
                                    for entry in entries {
                                        this.process_entry(queue, handler.as_ref(), entry).await;
                                    }
                                }
                                Err(e) => {
                                    tracing::warn!(queue = %queue, error = %e, "Queue read failed");
                                    tokio::time::sleep(Duration::from_millis(
                                        this.settings.backoff_delay_ms,
                                    ))
                                    .await;
                                }
                            }
                        }
                    }
                    tracing::debug!(queue = %queue, worker, "Queue worker stopped");
                })
            })
            .collect()
    }

    async fn process_entry(&self, queue: QueueName, handler: &dyn MessageHandler, entry: StreamEntry) {
        let group = &self.settings.consumer_group;

        let decoded = entry
            .payload()
            .ok_or_else(|| QueueError::Parse("missing payload field".into()))
            .and_then(QueueMessage::from_bytes);

        let mut message = match decoded {
            Ok(message) => message,
            Err(e) => {
                // Unparseable entries go straight to the dead-letter stream
                tracing::warn!(queue = %queue, id = %entry.id, error = %e, "Dead-lettering unparseable entry");
                let tombstone = QueueMessage {
                    id: Some(entry.id.clone()),
                    error: Some("parse".into()),
                    failed_at: Some(Utc::now()),
                    ..QueueMessage::new("unparseable", serde_json::Value::Null)
                };
                if let Ok(bytes) = tombstone.to_bytes()
                    && let Err(e) = self
                        .broker
                        .xadd(&queue.dlq_stream(), vec![("payload".to_string(), bytes)])
                        .await
                {
                    tracing::error!(queue = %queue, error = %e, "Failed to dead-letter entry");
                    return; // leave pending for a later claim
                }
                let _ = self.broker.xack(&queue.stream(), group, &entry.id).await;
                return;
            }
        };

        message.id.get_or_insert_with(|| entry.id.clone());
        message.attempts += 1;

        match handler.handle(&message).await {
            Ok(()) => {
                if self.settings.auto_ack
                    && let Err(e) = self.broker.xack(&queue.stream(), group, &entry.id).await
                {
                    tracing::warn!(queue = %queue, id = %entry.id, error = %e, "Ack failed");
                }
            }
            Err(e) => self.handle_failure(queue, &entry.id, message, e).await,
        }
    }

    async fn handle_failure(
        &self,
        queue: QueueName,
        entry_id: &str,
        mut message: QueueMessage,
        error: QueueError,
    ) {
        let group = &self.settings.consumer_group;
        message.error = Some(error.to_string());
        message.failed_at = Some(Utc::now());

        let result = if message.attempts >= message.max_attempts {
            tracing::warn!(
                queue = %queue,
                message_type = %message.message_type,
                attempts = message.attempts,
                error = %error,
                "Message exhausted retries, dead-lettering"
            );
            match message.to_bytes() {
                Ok(bytes) => self
                    .broker
                    .xadd(&queue.dlq_stream(), vec![("payload".to_string(), bytes)])
                    .await
                    .map(|_| ()),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to encode dead letter");
                    return;
                }
            }
        } else {
            let delay = self.backoff_delay(message.attempts);
            let not_before = Utc::now().timestamp_millis() as u64 + delay;
            tracing::debug!(
                queue = %queue,
                message_type = %message.message_type,
                attempts = message.attempts,
                delay_ms = delay,
                "Scheduling retry"
            );
            match message.to_bytes() {
                Ok(bytes) => self
                    .broker
                    .xadd(
                        &QueueName::Retry.stream(),
                        vec![
                            ("payload".to_string(), bytes),
                            ("not_before".to_string(), not_before.to_string().into_bytes()),
                            (
                                "target".to_string(),
                                QueueName::Normal.as_str().as_bytes().to_vec(),
                            ),
                        ],
                    )
                    .await
                    .map(|_| ()),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to encode retry");
                    return;
                }
            }
        };

        match result {
            // The original entry is consumed only once its successor exists
            Ok(()) => {
                if let Err(e) = self.broker.xack(&queue.stream(), group, entry_id).await {
                    tracing::warn!(queue = %queue, id = %entry_id, error = %e, "Ack failed after reroute");
                }
            }
            Err(e) => {
                tracing::error!(queue = %queue, id = %entry_id, error = %e, "Failed to reroute message");
            }
        }
    }

    /// Spawn the sweeper promoting due entries from the delayed stream
    pub fn start_delayed_sweeper(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        self.start_sweeper(QueueName::Delayed, shutdown)
    }

    /// Spawn the sweeper feeding due retries back into the priority streams
    pub fn start_retry_sweeper(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        self.start_sweeper(QueueName::Retry, shutdown)
    }

    fn start_sweeper(&self, source: QueueName, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            tracing::debug!(source = %source, "Queue sweeper started");
            // Due-time index of entries read but not yet promoted; entries
            // remain pending in the broker group until promotion acks them
            let mut due: BTreeMap<u64, Vec<(String, QueueName, Vec<u8>)>> = BTreeMap::new();
            let mut iterations: u32 = 0;

            loop {
                if *shutdown.borrow() {
                    break;
                }

                // Recover entries from sweepers that died mid-flight
                if iterations % SWEEP_CLAIM_EVERY == 0 {
                    match this
                        .broker
                        .claim(
                            &source.stream(),
                            &this.settings.consumer_group,
                            &this.consumer_name,
                            SWEEP_CLAIM_IDLE_MS,
                            this.settings.batch_size,
                        )
                        .await
                    {
                        Ok(entries) => {
                            for entry in entries {
                                Self::index_entry(&mut due, entry);
                            }
                        }
                        Err(e) => tracing::warn!(source = %source, error = %e, "Sweep claim failed"),
                    }
                }
                iterations = iterations.wrapping_add(1);

                let now = Utc::now().timestamp_millis() as u64;
                let next_due = due.keys().next().copied();
                let block_ms = match next_due {
                    Some(at) if at <= now => 0,
                    Some(at) => (at - now).min(QUEUE_SWEEP_TICK_MS),
                    None => QUEUE_SWEEP_TICK_MS,
                };

                let stream_name = source.stream();
                tokio::select! {
                    _ = shutdown.changed() => break,
                    batch = this.broker.xread_group(
                        &stream_name,
                        &this.settings.consumer_group,
                        &this.consumer_name,
                        this.settings.batch_size,
                        block_ms,
                    ) => match batch {
                        Ok(entries) => {
                            for entry in entries {
                                Self::index_entry(&mut due, entry);
                            }
                        }
                        Err(e) => {
                            tracing::warn!(source = %source, error = %e, "Sweep read failed");
                            tokio::time::sleep(Duration::from_millis(this.settings.backoff_delay_ms)).await;
                        }
                    }
                }

                this.promote_due(source, &mut due).await;
            }
            tracing::debug!(source = %source, "Queue sweeper stopped");
        })
    }

    fn index_entry(
        due: &mut BTreeMap<u64, Vec<(String, QueueName, Vec<u8>)>>,
        entry: StreamEntry,
    ) {
        let not_before = entry
            .fields
            .get("not_before")
            .and_then(|v| std::str::from_utf8(v).ok())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        let target = entry
            .fields
            .get("target")
            .and_then(|v| std::str::from_utf8(v).ok())
            .and_then(QueueName::parse)
            .unwrap_or(QueueName::Normal);
        let Some(payload) = entry.payload().map(|p| p.to_vec()) else {
            tracing::warn!(id = %entry.id, "Sweep entry missing payload");
            return;
        };
        due.entry(not_before)
            .or_default()
            .push((entry.id, target, payload));
    }

    async fn promote_due(
        &self,
        source: QueueName,
        due: &mut BTreeMap<u64, Vec<(String, QueueName, Vec<u8>)>>,
    ) {
        let now = Utc::now().timestamp_millis() as u64;
        let ready: Vec<u64> = due.range(..=now).map(|(&k, _)| k).collect();

        for key in ready {
            let Some(entries) = due.remove(&key) else {
                continue;
            };
            let mut not_promoted = Vec::new();
            for (id, target, payload) in entries {
                let added = self
                    .broker
                    .xadd(&target.stream(), vec![("payload".to_string(), payload.clone())])
                    .await;
                match added {
                    Ok(_) => {
                        if let Err(e) = self
                            .broker
                            .xack(&source.stream(), &self.settings.consumer_group, &id)
                            .await
                        {
                            tracing::warn!(source = %source, id = %id, error = %e, "Ack failed after promote");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(source = %source, id = %id, error = %e, "Promote failed, will retry");
                        not_promoted.push((id, target, payload));
                    }
                }
            }
            if !not_promoted.is_empty() {
                due.entry(key).or_default().extend(not_promoted);
            }
        }
    }

    /// Drain a bounded batch from a queue's dead-letter stream back into the
    /// queue, resetting delivery state. DLQ entries are acknowledged only
    /// after the re-enqueue succeeds. Returns the number reprocessed.
    pub async fn reprocess_dead_letter_queue(
        &self,
        queue: QueueName,
    ) -> Result<usize, QueueError> {
        let group = &self.settings.consumer_group;
        let dlq = queue.dlq_stream();

        let entries = self
            .broker
            .xread_group(&dlq, group, &self.consumer_name, DLQ_REPROCESS_BATCH, 0)
            .await?;

        let mut reprocessed = 0;
        for entry in entries {
            let decoded = entry
                .payload()
                .ok_or_else(|| QueueError::Parse("missing payload field".into()))
                .and_then(QueueMessage::from_bytes);

            let mut message = match decoded {
                Ok(message) => message,
                Err(e) => {
                    // Nothing to salvage; drop the tombstone
                    tracing::warn!(queue = %queue, id = %entry.id, error = %e, "Dropping unreadable dead letter");
                    self.broker.xack(&dlq, group, &entry.id).await?;
                    continue;
                }
            };

            message.id = None;
            message.attempts = 0;
            message.error = None;
            message.failed_at = None;

            let bytes = message.to_bytes()?;
            self.broker
                .xadd(&queue.stream(), vec![("payload".to_string(), bytes)])
                .await?;
            self.broker.xack(&dlq, group, &entry.id).await?;
            reprocessed += 1;
        }

        if reprocessed > 0 {
            tracing::info!(queue = %queue, count = reprocessed, "Reprocessed dead letters");
        }
        Ok(reprocessed)
    }

    /// Drop a queue's stream; the consumer group must be re-created
    /// (e.g. by calling `init` again) before consuming resumes
    pub async fn purge(&self, queue: QueueName) -> Result<(), QueueError> {
        self.broker.del(&queue.stream()).await?;
        tracing::info!(queue = %queue, "Queue purged");
        Ok(())
    }

    /// Stream lengths for monitoring
    pub async fn stats(&self) -> Result<BTreeMap<String, u64>, QueueError> {
        let mut stats = BTreeMap::new();
        for queue in [
            QueueName::High,
            QueueName::Normal,
            QueueName::Low,
            QueueName::Delayed,
            QueueName::Retry,
        ] {
            stats.insert(
                queue.as_str().to_string(),
                self.broker.xlen(&queue.stream()).await?,
            );
        }
        for queue in QueueName::priority_queues() {
            stats.insert(
                format!("dlq:{}", queue.as_str()),
                self.broker.xlen(&queue.dlq_stream()).await?,
            );
        }
        Ok(stats)
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    fn test_settings() -> QueueSettings {
        QueueSettings {
            backoff_delay_ms: 20,
            max_backoff_ms: 500,
            block_ms: 50,
            batch_size: 16,
            concurrency: 1,
            ..QueueSettings::default()
        }
    }

    async fn test_queue() -> MessageQueue {
        let queue = MessageQueue::new(Broker::in_memory(), test_settings());
        queue.init().await.unwrap();
        queue
    }

    struct FailingHandler {
        calls: AtomicU32,
        seen_attempts: Mutex<Vec<u32>>,
    }

    impl FailingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                seen_attempts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl MessageHandler for FailingHandler {
        async fn handle(&self, message: &QueueMessage) -> Result<(), QueueError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_attempts.lock().push(message.attempts);
            Err(QueueError::handler("boom"))
        }
    }

    struct RecordingHandler {
        payloads: Mutex<Vec<serde_json::Value>>,
    }

    impl RecordingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                payloads: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl MessageHandler for RecordingHandler {
        async fn handle(&self, message: &QueueMessage) -> Result<(), QueueError> {
            self.payloads.lock().push(message.payload.clone());
            Ok(())
        }
    }

    #[test]
    fn test_enqueue_routing_policy() {
        assert_eq!(MessageQueue::route(0, None), QueueName::Normal);
        assert_eq!(MessageQueue::route(6, None), QueueName::High);
        assert_eq!(MessageQueue::route(-1, None), QueueName::Low);
        assert_eq!(MessageQueue::route(5, None), QueueName::Normal);
        assert_eq!(MessageQueue::route(9, Some(100)), QueueName::Delayed);
        assert_eq!(MessageQueue::route(0, Some(0)), QueueName::Normal);
    }

    #[test]
    fn test_exponential_backoff_caps() {
        let queue = MessageQueue::new(
            Broker::in_memory(),
            QueueSettings {
                backoff_delay_ms: 1_000,
                max_backoff_ms: 30_000,
                ..QueueSettings::default()
            },
        );
        assert_eq!(queue.backoff_delay(1), 1_000);
        assert_eq!(queue.backoff_delay(2), 2_000);
        assert_eq!(queue.backoff_delay(3), 4_000);
        assert_eq!(queue.backoff_delay(6), 30_000);
        assert_eq!(queue.backoff_delay(40), 30_000);
    }

    #[test]
    fn test_fixed_backoff() {
        let queue = MessageQueue::new(
            Broker::in_memory(),
            QueueSettings {
                backoff_mode: BackoffMode::Fixed,
                backoff_delay_ms: 700,
                ..QueueSettings::default()
            },
        );
        assert_eq!(queue.backoff_delay(1), 700);
        assert_eq!(queue.backoff_delay(5), 700);
    }

    #[tokio::test]
    async fn test_enqueue_dequeue_ack_round_trip() {
        let queue = test_queue().await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let payload = serde_json::json!({"n": 1});
        queue
            .enqueue(QueueMessage::new("work", payload.clone()))
            .await
            .unwrap();

        let handler = RecordingHandler::new();
        let workers = queue.start_workers(QueueName::Normal, handler.clone(), shutdown_rx);

        tokio::time::timeout(Duration::from_secs(2), async {
            while handler.payloads.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(handler.payloads.lock().as_slice(), &[payload]);
        // Entry was consumed exactly once: nothing pending, stream intact
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats["normal-priority"], 1);

        shutdown_tx.send(true).unwrap();
        futures::future::join_all(workers).await;
    }

    #[tokio::test]
    async fn test_priority_routing_lands_on_high_stream() {
        let queue = test_queue().await;
        queue
            .enqueue(QueueMessage::new("work", serde_json::json!({})).with_priority(9))
            .await
            .unwrap();
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats["high-priority"], 1);
        assert_eq!(stats["normal-priority"], 0);
    }

    #[tokio::test]
    async fn test_retry_to_dead_letter_flow() {
        let queue = test_queue().await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handler = FailingHandler::new();
        let mut tasks = queue.start_workers(QueueName::Normal, handler.clone(), shutdown_rx.clone());
        tasks.push(queue.start_retry_sweeper(shutdown_rx));

        let started = Instant::now();
        queue
            .enqueue(
                QueueMessage::new("work", serde_json::json!({"n": 1})).with_max_attempts(3),
            )
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while queue.stats().await.unwrap()["dlq:normal-priority"] == 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("message should reach the DLQ");

        // Three deliveries, attempt numbers 1, 2, 3
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(handler.seen_attempts.lock().as_slice(), &[1, 2, 3]);
        // Backoffs of 20ms + 40ms elapsed between deliveries
        assert!(started.elapsed() >= Duration::from_millis(60));

        // The dead letter carries the final delivery state
        let entries = queue
            .broker
            .xread(&QueueName::Normal.dlq_stream(), "0", 10)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        let dead = QueueMessage::from_bytes(entries[0].payload().unwrap()).unwrap();
        assert_eq!(dead.attempts, 3);
        assert!(dead.error.is_some());
        assert!(dead.failed_at.is_some());

        shutdown_tx.send(true).unwrap();
        futures::future::join_all(tasks).await;
    }

    #[tokio::test]
    async fn test_delayed_enqueue_promotes_when_due() {
        let queue = test_queue().await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handler = RecordingHandler::new();
        let mut tasks = queue.start_workers(QueueName::Normal, handler.clone(), shutdown_rx.clone());
        tasks.push(queue.start_delayed_sweeper(shutdown_rx));

        let started = Instant::now();
        queue
            .enqueue(QueueMessage::new("later", serde_json::json!({})).with_delay_ms(80))
            .await
            .unwrap();
        assert_eq!(queue.stats().await.unwrap()["delayed"], 1);

        tokio::time::timeout(Duration::from_secs(3), async {
            while handler.payloads.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(80));

        shutdown_tx.send(true).unwrap();
        futures::future::join_all(tasks).await;
    }

    #[tokio::test]
    async fn test_parse_error_goes_straight_to_dlq() {
        let queue = test_queue().await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Raw garbage on the stream, not a QueueMessage
        queue
            .broker
            .xadd(
                &QueueName::Normal.stream(),
                vec![("payload".to_string(), b"garbage".to_vec())],
            )
            .await
            .unwrap();

        let handler = RecordingHandler::new();
        let tasks = queue.start_workers(QueueName::Normal, handler.clone(), shutdown_rx);

        tokio::time::timeout(Duration::from_secs(2), async {
            while queue.stats().await.unwrap()["dlq:normal-priority"] == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert!(handler.payloads.lock().is_empty());
        let entries = queue
            .broker
            .xread(&QueueName::Normal.dlq_stream(), "0", 10)
            .await
            .unwrap();
        let dead = QueueMessage::from_bytes(entries[0].payload().unwrap()).unwrap();
        assert_eq!(dead.error.as_deref(), Some("parse"));

        shutdown_tx.send(true).unwrap();
        futures::future::join_all(tasks).await;
    }

    #[tokio::test]
    async fn test_reprocess_dead_letter_queue_acks_entries() {
        let queue = test_queue().await;

        // Plant a dead letter by hand
        let dead = QueueMessage {
            attempts: 3,
            error: Some("boom".into()),
            failed_at: Some(Utc::now()),
            ..QueueMessage::new("work", serde_json::json!({"n": 1}))
        };
        queue
            .broker
            .xadd(
                &QueueName::Normal.dlq_stream(),
                vec![("payload".to_string(), dead.to_bytes().unwrap())],
            )
            .await
            .unwrap();

        let count = queue
            .reprocess_dead_letter_queue(QueueName::Normal)
            .await
            .unwrap();
        assert_eq!(count, 1);

        // Message is back on the queue with a clean slate
        let entries = queue
            .broker
            .xread(&QueueName::Normal.stream(), "0", 10)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        let revived = QueueMessage::from_bytes(entries[0].payload().unwrap()).unwrap();
        assert_eq!(revived.attempts, 0);
        assert!(revived.error.is_none());
        assert!(revived.failed_at.is_none());

        // DLQ entries were acked; a second pass finds nothing
        let again = queue
            .reprocess_dead_letter_queue(QueueName::Normal)
            .await
            .unwrap();
        assert_eq!(again, 0);
    }

    #[tokio::test]
    async fn test_purge_drops_stream() {
        let queue = test_queue().await;
        queue
            .enqueue(QueueMessage::new("work", serde_json::json!({})))
            .await
            .unwrap();
        queue.purge(QueueName::Normal).await.unwrap();
        assert_eq!(queue.stats().await.unwrap()["normal-priority"], 0);
    }
}

//! In-memory stream broker
//!
//! Single-process semantics:
//! - Streams: `VecDeque` entries with monotonic sequence ids, consumer
//!   groups tracked as a group cursor plus a pending map
//! - Pub/sub: tokio broadcast channels
//!
//! ## Limitations
//!
//! A process crash loses all entries; cross-process coordination needs the
//! Redis backend. Blocking reads use a per-stream `Notify` so new entries
//! wake readers without polling.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_stream::stream;
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{Notify, broadcast};

use super::error::BrokerError;
use super::{StreamBroker, StreamEntry, TopicSubscription};

/// Default broadcast channel capacity
const DEFAULT_BROADCAST_CAPACITY: usize = 10_000;

/// Default stream max length (approximate, trimmed on add)
const DEFAULT_STREAM_MAX_LEN: usize = 100_000;

#[derive(Clone)]
struct StoredEntry {
    seq: u64,
    fields: HashMap<String, Vec<u8>>,
}

#[derive(Default)]
struct GroupState {
    /// Highest sequence handed out to any consumer of this group
    last_delivered: u64,
    /// Pending entries: seq -> (consumer, delivery time)
    pending: HashMap<u64, (String, Instant)>,
}

struct StreamState {
    entries: VecDeque<StoredEntry>,
    groups: HashMap<String, GroupState>,
    next_seq: u64,
    max_len: usize,
}

impl Default for StreamState {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
            groups: HashMap::new(),
            next_seq: 1,
            max_len: DEFAULT_STREAM_MAX_LEN,
        }
    }
}

struct SharedState {
    streams: RwLock<HashMap<String, StreamState>>,
    notifiers: RwLock<HashMap<String, Arc<Notify>>>,
    topics: RwLock<HashMap<String, broadcast::Sender<Vec<u8>>>>,
}

/// In-memory broker backend
pub struct MemoryBroker {
    state: Arc<SharedState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(SharedState {
                streams: RwLock::new(HashMap::new()),
                notifiers: RwLock::new(HashMap::new()),
                topics: RwLock::new(HashMap::new()),
            }),
        }
    }

    fn notifier(&self, stream: &str) -> Arc<Notify> {
        {
            let notifiers = self.state.notifiers.read();
            if let Some(n) = notifiers.get(stream) {
                return Arc::clone(n);
            }
        }
        let mut notifiers = self.state.notifiers.write();
        Arc::clone(
            notifiers
                .entry(stream.to_string())
                .or_insert_with(|| Arc::new(Notify::new())),
        )
    }

    fn topic_sender(&self, topic: &str) -> broadcast::Sender<Vec<u8>> {
        {
            let topics = self.state.topics.read();
            if let Some(sender) = topics.get(topic) {
                return sender.clone();
            }
        }
        let mut topics = self.state.topics.write();
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(DEFAULT_BROADCAST_CAPACITY).0)
            .clone()
    }

    fn trim(stream: &mut StreamState) {
        while stream.entries.len() > stream.max_len {
            if let Some(entry) = stream.entries.pop_front() {
                for group in stream.groups.values_mut() {
                    group.pending.remove(&entry.seq);
                }
            }
        }
    }

    /// One non-blocking group read attempt
    fn try_read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Vec<StreamEntry> {
        let mut streams = self.state.streams.write();
        let Some(state) = streams.get_mut(stream) else {
            return Vec::new();
        };
        let Some(group_state) = state.groups.get_mut(group) else {
            return Vec::new();
        };

        let mut batch = Vec::new();
        for entry in &state.entries {
            if batch.len() >= count {
                break;
            }
            if entry.seq > group_state.last_delivered {
                group_state
                    .pending
                    .insert(entry.seq, (consumer.to_string(), Instant::now()));
                group_state.last_delivered = entry.seq;
                batch.push(StreamEntry {
                    id: entry.seq.to_string(),
                    fields: entry.fields.clone(),
                });
            }
        }
        batch
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_seq(id: &str) -> Result<u64, BrokerError> {
    id.parse()
        .map_err(|_| BrokerError::Stream(format!("invalid entry id: {id}")))
}

#[async_trait]
impl StreamBroker for MemoryBroker {
    async fn xadd(
        &self,
        stream: &str,
        fields: Vec<(String, Vec<u8>)>,
    ) -> Result<String, BrokerError> {
        let seq = {
            let mut streams = self.state.streams.write();
            let state = streams.entry(stream.to_string()).or_default();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.entries.push_back(StoredEntry {
                seq,
                fields: fields.into_iter().collect(),
            });
            Self::trim(state);
            seq
        };

        self.notifier(stream).notify_waiters();
        Ok(seq.to_string())
    }

    async fn xread(
        &self,
        stream: &str,
        from_id: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let from = if from_id == "0" {
            0
        } else {
            parse_seq(from_id)?
        };
        let streams = self.state.streams.read();
        let Some(state) = streams.get(stream) else {
            return Ok(Vec::new());
        };
        Ok(state
            .entries
            .iter()
            .filter(|e| e.seq > from)
            .take(count)
            .map(|e| StreamEntry {
                id: e.seq.to_string(),
                fields: e.fields.clone(),
            })
            .collect())
    }

    async fn xread_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let deadline = Instant::now() + Duration::from_millis(block_ms);
        let notifier = self.notifier(stream);

        loop {
            let batch = self.try_read_group(stream, group, consumer, count);
            if !batch.is_empty() {
                return Ok(batch);
            }

            // Register interest before the re-check so an add between the
            // check and the await still wakes us
            let notified = notifier.notified();
            let batch = self.try_read_group(stream, group, consumer, count);
            if !batch.is_empty() {
                return Ok(batch);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(remaining) => return Ok(Vec::new()),
            }
        }
    }

    async fn xack(&self, stream: &str, group: &str, id: &str) -> Result<(), BrokerError> {
        let seq = parse_seq(id)?;
        let mut streams = self.state.streams.write();
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| BrokerError::Stream(format!("stream not found: {stream}")))?;
        let group_state = state
            .groups
            .get_mut(group)
            .ok_or_else(|| BrokerError::ConsumerGroup(format!("group not found: {group}")))?;
        group_state.pending.remove(&seq);
        Ok(())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let mut streams = self.state.streams.write();
        let Some(state) = streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let Some(group_state) = state.groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        let now = Instant::now();
        let min_idle = Duration::from_millis(min_idle_ms);
        let idle_seqs: Vec<u64> = group_state
            .pending
            .iter()
            .filter(|(_, (_, delivered))| now.duration_since(*delivered) >= min_idle)
            .map(|(&seq, _)| seq)
            .take(count)
            .collect();

        let mut claimed = Vec::new();
        for seq in idle_seqs {
            if let Some(entry) = state.entries.iter().find(|e| e.seq == seq) {
                group_state
                    .pending
                    .insert(seq, (consumer.to_string(), Instant::now()));
                claimed.push(StreamEntry {
                    id: seq.to_string(),
                    fields: entry.fields.clone(),
                });
            }
        }
        Ok(claimed)
    }

    async fn xlen(&self, stream: &str) -> Result<u64, BrokerError> {
        let streams = self.state.streams.read();
        Ok(streams
            .get(stream)
            .map(|s| s.entries.len() as u64)
            .unwrap_or(0))
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
    ) -> Result<(), BrokerError> {
        let mut streams = self.state.streams.write();
        let state = streams.entry(stream.to_string()).or_default();
        if state.groups.contains_key(group) {
            return Ok(());
        }
        let last_delivered = match start_id {
            "$" => state.next_seq.saturating_sub(1),
            "0" => 0,
            other => parse_seq(other)?,
        };
        state.groups.insert(
            group.to_string(),
            GroupState {
                last_delivered,
                pending: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        // Ignore send errors - no active subscribers
        let _ = self.topic_sender(topic).send(payload.to_vec());
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<TopicSubscription, BrokerError> {
        let mut receiver = self.topic_sender(topic).subscribe();

        let stream = stream! {
            loop {
                match receiver.recv().await {
                    Ok(payload) => yield Ok(payload),
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        yield Err(BrokerError::Lagged(n));
                    }
                }
            }
        };

        Ok(TopicSubscription {
            receiver: Box::pin(stream),
        })
    }

    async fn del(&self, stream: &str) -> Result<(), BrokerError> {
        self.state.streams.write().remove(stream);
        Ok(())
    }

    async fn health_check(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

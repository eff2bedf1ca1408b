//! Queue message shapes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::QueueError;

/// Logical queues; each maps to one broker stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    High,
    Normal,
    Low,
    Delayed,
    Retry,
    DeadLetter,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::High => "high-priority",
            QueueName::Normal => "normal-priority",
            QueueName::Low => "low-priority",
            QueueName::Delayed => "delayed",
            QueueName::Retry => "retry",
            QueueName::DeadLetter => "dead-letter",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "high-priority" => Some(QueueName::High),
            "normal-priority" => Some(QueueName::Normal),
            "low-priority" => Some(QueueName::Low),
            "delayed" => Some(QueueName::Delayed),
            "retry" => Some(QueueName::Retry),
            "dead-letter" => Some(QueueName::DeadLetter),
            _ => None,
        }
    }

    /// The three priority queues served by worker pools
    pub fn priority_queues() -> [QueueName; 3] {
        [QueueName::High, QueueName::Normal, QueueName::Low]
    }

    pub fn all() -> [QueueName; 6] {
        [
            QueueName::High,
            QueueName::Normal,
            QueueName::Low,
            QueueName::Delayed,
            QueueName::Retry,
            QueueName::DeadLetter,
        ]
    }

    /// Broker stream backing this queue
    pub fn stream(&self) -> String {
        crate::broker::queue_stream(self.as_str())
    }

    /// Broker stream backing this queue's dead letters
    pub fn dlq_stream(&self) -> String {
        crate::broker::dlq_stream(self.as_str())
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A message travelling through the queue
///
/// Immutable once enqueued except for the delivery-tracking fields
/// (`attempts`, `processed_at`, `failed_at`, `error`), which the consumer
/// loop maintains. `attempts` never exceeds `max_attempts`; crossing the
/// ceiling moves the message to the dead-letter stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Broker stream id; assigned on enqueue
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub message_type: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub delay_ms: Option<u64>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub organization_id: Option<String>,
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl QueueMessage {
    pub fn new(message_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: None,
            message_type: message_type.into(),
            payload,
            priority: 0,
            delay_ms: None,
            attempts: 0,
            max_attempts: crate::core::constants::DEFAULT_QUEUE_MAX_ATTEMPTS,
            organization_id: None,
            user_id: None,
            created_at: Utc::now(),
            processed_at: None,
            failed_at: None,
            error: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = Some(delay_ms);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_tenant(mut self, organization_id: impl Into<String>) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Binary encoding used on broker streams
    pub fn to_bytes(&self) -> Result<Vec<u8>, QueueError> {
        rmp_serde::to_vec(self).map_err(|e| QueueError::Parse(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, QueueError> {
        rmp_serde::from_slice(bytes).map_err(|e| QueueError::Parse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_name_round_trip() {
        for queue in QueueName::all() {
            assert_eq!(QueueName::parse(queue.as_str()), Some(queue));
        }
        assert_eq!(QueueName::parse("bogus"), None);
    }

    #[test]
    fn test_stream_keys() {
        assert_eq!(QueueName::High.stream(), "apix:queue:high-priority");
        assert_eq!(QueueName::Normal.dlq_stream(), "apix:dlq:normal-priority");
    }

    #[test]
    fn test_message_binary_round_trip() {
        let msg = QueueMessage::new("work", serde_json::json!({"n": 1}))
            .with_priority(7)
            .with_tenant("org-a")
            .with_max_attempts(5);
        let bytes = msg.to_bytes().unwrap();
        let decoded = QueueMessage::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        assert!(QueueMessage::from_bytes(b"not msgpack at all").is_err());
    }
}

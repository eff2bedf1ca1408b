//! Wire protocol frames
//!
//! One UTF-8 JSON frame per message. Inbound frames are demuxed on their
//! `type` field; unknown types are answered with an error frame without
//! disconnecting, malformed JSON counts toward the parse-error threshold.

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;

use crate::realtime::Event;
use crate::store::ClientType;

/// WebSocket close codes
pub mod close_code {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Repeated malformed frames
    pub const PARSE_LIMIT: u16 = 4000;
    /// Authentication failed or access denied
    pub const UNAUTHORIZED: u16 = 4001;
    /// Inbound frame rate limit exceeded
    pub const RATE_LIMITED: u16 = 4003;
    /// Tenant suspended or over connection quota
    pub const TENANT_SUSPENDED: u16 = 4008;
    /// Server is shutting down
    pub const SERVER_SHUTDOWN: u16 = 4011;
    /// Node at capacity; try again later
    pub const TRY_AGAIN_LATER: u16 = 1013;
}

/// Frame metadata envelope
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FrameMetadata {
    /// Client wall-clock in epoch milliseconds
    pub timestamp: Option<i64>,
    #[serde(rename = "correlation_id")]
    pub correlation_id: Option<String>,
}

/// Client-to-server frames
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InboundFrame {
    Auth {
        token: String,
        #[serde(rename = "clientType")]
        client_type: Option<ClientType>,
        /// Present when resuming an existing session after a drop
        #[serde(rename = "sessionId")]
        session_id: Option<String>,
        #[serde(default)]
        metadata: Value,
    },
    Subscribe {
        channel: String,
        filters: Option<Value>,
        #[serde(default)]
        acknowledgment: bool,
    },
    Unsubscribe {
        channel: String,
    },
    Publish {
        channel: String,
        #[serde(default)]
        payload: Value,
        #[serde(rename = "eventType")]
        event_type: Option<String>,
        #[serde(default)]
        priority: i32,
        #[serde(default)]
        acknowledgment: bool,
        metadata: Option<FrameMetadata>,
    },
    Heartbeat {
        metadata: Option<FrameMetadata>,
    },
    Ping {
        metadata: Option<FrameMetadata>,
    },
    Ack {
        #[serde(rename = "eventId")]
        event_id: String,
    },
}

/// Why an inbound frame failed to parse
#[derive(Debug)]
pub enum FrameError {
    /// Not JSON, or missing required fields
    Malformed(String),
    /// Well-formed JSON with an unrecognized `type`
    UnknownType(String),
}

impl InboundFrame {
    /// Two-step parse so unknown types are distinguishable from junk
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| FrameError::Malformed(e.to_string()))?;
        let frame_type = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| FrameError::Malformed("missing type field".into()))?;

        match frame_type {
            "auth" | "subscribe" | "unsubscribe" | "publish" | "heartbeat" | "ping" | "ack" => {
                serde_json::from_value(value).map_err(|e| FrameError::Malformed(e.to_string()))
            }
            other => Err(FrameError::UnknownType(other.to_string())),
        }
    }

    /// Event type for a publish frame: explicit field, then the payload's
    /// own `type`, then a generic fallback
    pub fn resolve_event_type(event_type: &Option<String>, payload: &Value) -> String {
        event_type
            .clone()
            .or_else(|| {
                payload
                    .get("type")
                    .and_then(|t| t.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "message".to_string())
    }
}

/// Server-to-client frames
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    /// A routed event, serialized as the bare event object
    Event(Event),
    Pong,
    Subscribed { channel: String },
    Unsubscribed { channel: String },
    Published { event_id: String },
    Error { code: &'static str, reason: String },
}

impl OutboundFrame {
    pub fn error(code: &'static str, reason: impl Into<String>) -> Self {
        Self::Error {
            code,
            reason: reason.into(),
        }
    }

    pub fn to_json(&self) -> String {
        match self {
            OutboundFrame::Event(event) => {
                serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string())
            }
            OutboundFrame::Pong => serde_json::json!({
                "type": "pong",
                "timestamp": Utc::now().timestamp_millis(),
            })
            .to_string(),
            OutboundFrame::Subscribed { channel } => serde_json::json!({
                "type": "subscribed",
                "channel": channel,
            })
            .to_string(),
            OutboundFrame::Unsubscribed { channel } => serde_json::json!({
                "type": "unsubscribed",
                "channel": channel,
            })
            .to_string(),
            OutboundFrame::Published { event_id } => serde_json::json!({
                "type": "published",
                "id": event_id,
            })
            .to_string(),
            OutboundFrame::Error { code, reason } => serde_json::json!({
                "type": "error",
                "code": code,
                "reason": reason,
            })
            .to_string(),
        }
    }
}

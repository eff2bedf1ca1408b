//! Events and channel classification

use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::EventRow;

/// Channel names: lowercase alphanumeric segments, dot/underscore/dash
static CHANNEL_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9._-]{0,127}$").expect("static regex"));

/// Channel flavor, derived from the channel name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelType {
    AgentEvents,
    ToolEvents,
    WorkflowEvents,
    ProviderEvents,
    SystemEvents,
    PrivateUser,
    Organization,
}

impl ChannelType {
    /// Classify a validated channel name; None for unknown names
    pub fn classify(name: &str) -> Option<Self> {
        if !CHANNEL_NAME.is_match(name) {
            return None;
        }
        match name {
            "agent_events" => Some(ChannelType::AgentEvents),
            "tool_events" => Some(ChannelType::ToolEvents),
            "workflow_events" => Some(ChannelType::WorkflowEvents),
            "provider_events" => Some(ChannelType::ProviderEvents),
            "system_events" => Some(ChannelType::SystemEvents),
            _ if name.strip_prefix("user.").is_some_and(|rest| !rest.is_empty()) => {
                Some(ChannelType::PrivateUser)
            }
            _ if name.strip_prefix("org.").is_some_and(|rest| !rest.is_empty()) => {
                Some(ChannelType::Organization)
            }
            _ => None,
        }
    }

    /// System channels are shared across tenants (one global registry entry)
    pub fn is_global(&self) -> bool {
        matches!(self, ChannelType::SystemEvents)
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelType::AgentEvents => "AGENT_EVENTS",
            ChannelType::ToolEvents => "TOOL_EVENTS",
            ChannelType::WorkflowEvents => "WORKFLOW_EVENTS",
            ChannelType::ProviderEvents => "PROVIDER_EVENTS",
            ChannelType::SystemEvents => "SYSTEM_EVENTS",
            ChannelType::PrivateUser => "PRIVATE_USER",
            ChannelType::Organization => "ORGANIZATION",
        };
        write!(f, "{s}")
    }
}

/// A routed event; immutable once enqueued
///
/// Serializes to the wire frame shape: `created_at` becomes `timestamp`
/// (RFC 3339), field names are camelCase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub channel: String,
    pub payload: serde_json::Value,
    pub organization_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub acknowledgment: bool,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(rename = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl Event {
    pub fn new(
        event_type: impl Into<String>,
        channel: impl Into<String>,
        payload: serde_json::Value,
        organization_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            channel: channel.into(),
            payload,
            organization_id: organization_id.into(),
            user_id: None,
            session_id: None,
            acknowledgment: false,
            retry_count: 0,
            created_at: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Durable row mirror
    pub fn to_row(&self) -> EventRow {
        EventRow {
            id: self.id.clone(),
            event_type: self.event_type.clone(),
            channel: self.channel.clone(),
            payload: self.payload.clone(),
            organization_id: self.organization_id.clone(),
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
            acknowledgment: self.acknowledgment,
            retry_count: self.retry_count,
            created_at: self.created_at,
            metadata: if self.metadata.is_null() {
                serde_json::Value::Null
            } else {
                self.metadata.clone()
            },
        }
    }
}

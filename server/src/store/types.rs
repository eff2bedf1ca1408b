//! Durable row shapes for the metadata store
//!
//! Rows mirror the hot in-memory state owned by the realtime components.
//! Every tenant-owned row carries an `organization_id`; read paths filter by
//! the active tenant context.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Enums
// =============================================================================

/// Client transport flavor reported in the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientType {
    WebApp,
    MobileApp,
    SdkWidget,
    ApiClient,
    InternalService,
}

impl fmt::Display for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClientType::WebApp => "WEB_APP",
            ClientType::MobileApp => "MOBILE_APP",
            ClientType::SdkWidget => "SDK_WIDGET",
            ClientType::ApiClient => "API_CLIENT",
            ClientType::InternalService => "INTERNAL_SERVICE",
        };
        write!(f, "{s}")
    }
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Reconnecting,
    Suspended,
    Failed,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connected => "CONNECTED",
            ConnectionStatus::Disconnected => "DISCONNECTED",
            ConnectionStatus::Reconnecting => "RECONNECTING",
            ConnectionStatus::Suspended => "SUSPENDED",
            ConnectionStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CONNECTED" => Some(ConnectionStatus::Connected),
            "DISCONNECTED" => Some(ConnectionStatus::Disconnected),
            "RECONNECTING" => Some(ConnectionStatus::Reconnecting),
            "SUSPENDED" => Some(ConnectionStatus::Suspended),
            "FAILED" => Some(ConnectionStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Coarse link-health classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Poor,
    Critical,
}

impl ConnectionQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionQuality::Excellent => "EXCELLENT",
            ConnectionQuality::Good => "GOOD",
            ConnectionQuality::Poor => "POOR",
            ConnectionQuality::Critical => "CRITICAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "EXCELLENT" => Some(ConnectionQuality::Excellent),
            "GOOD" => Some(ConnectionQuality::Good),
            "POOR" => Some(ConnectionQuality::Poor),
            "CRITICAL" => Some(ConnectionQuality::Critical),
            _ => None,
        }
    }

    /// Weight used by the adaptive reconnection strategy (EXCELLENT=1.0 .. CRITICAL=2.0)
    pub fn weight(&self) -> f64 {
        match self {
            ConnectionQuality::Excellent => 1.0,
            ConnectionQuality::Good => 1.25,
            ConnectionQuality::Poor => 1.5,
            ConnectionQuality::Critical => 2.0,
        }
    }
}

impl fmt::Display for ConnectionQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Privilege tier of a role
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoleLevel {
    Viewer,
    Developer,
    OrgAdmin,
    SuperAdmin,
}

impl RoleLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoleLevel::Viewer => "VIEWER",
            RoleLevel::Developer => "DEVELOPER",
            RoleLevel::OrgAdmin => "ORG_ADMIN",
            RoleLevel::SuperAdmin => "SUPER_ADMIN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "VIEWER" => Some(RoleLevel::Viewer),
            "DEVELOPER" => Some(RoleLevel::Developer),
            "ORG_ADMIN" => Some(RoleLevel::OrgAdmin),
            "SUPER_ADMIN" => Some(RoleLevel::SuperAdmin),
            _ => None,
        }
    }
}

// =============================================================================
// Rows
// =============================================================================

/// Tenant (organization) row
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OrganizationRow {
    pub id: String,
    pub slug: String,
    pub max_users: u64,
    pub max_connections: u64,
    pub max_events: u64,
    pub max_channels: u64,
    pub max_storage: u64,
    pub max_api_calls: u64,
    pub features: Vec<String>,
    pub settings: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Principal (user) row; belongs to exactly one tenant
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct UserRow {
    pub id: String,
    pub organization_id: String,
    pub email: String,
    pub password_hash: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Role row; name is unique within its organization
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RoleRow {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub permissions: Vec<String>,
    pub level: RoleLevel,
    pub is_system: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Role assignment; user and role must share an organization
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct UserRoleRow {
    pub user_id: String,
    pub role_id: String,
    pub scope: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Durable mirror of a session's hot state
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ConnectionRow {
    pub session_id: String,
    pub organization_id: String,
    pub user_id: Option<String>,
    pub client_type: ClientType,
    pub status: ConnectionStatus,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
    pub max_reconnect_attempts: u32,
    pub next_reconnect_at: Option<DateTime<Utc>>,
    pub quality: ConnectionQuality,
    pub latency_ms: f64,
    pub missed_heartbeats: u32,
    pub total_disconnections: u32,
    pub metadata: serde_json::Value,
}

/// Append-only event row
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EventRow {
    pub id: String,
    pub event_type: String,
    pub channel: String,
    pub payload: serde_json::Value,
    pub organization_id: String,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub acknowledgment: bool,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

/// Append-only audit entry
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AuditRow {
    pub id: String,
    pub organization_id: String,
    pub user_id: Option<String>,
    pub action: String,
    pub resource: String,
    pub outcome: String,
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            ConnectionStatus::Connected,
            ConnectionStatus::Disconnected,
            ConnectionStatus::Reconnecting,
            ConnectionStatus::Suspended,
            ConnectionStatus::Failed,
        ] {
            assert_eq!(ConnectionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ConnectionStatus::parse("BOGUS"), None);
    }

    #[test]
    fn test_quality_weights_are_monotonic() {
        assert!(ConnectionQuality::Excellent.weight() < ConnectionQuality::Good.weight());
        assert!(ConnectionQuality::Good.weight() < ConnectionQuality::Poor.weight());
        assert!(ConnectionQuality::Poor.weight() < ConnectionQuality::Critical.weight());
    }

    #[test]
    fn test_wire_serialization_uses_screaming_snake() {
        let json = serde_json::to_string(&ClientType::SdkWidget).unwrap();
        assert_eq!(json, "\"SDK_WIDGET\"");
        let json = serde_json::to_string(&ConnectionQuality::Excellent).unwrap();
        assert_eq!(json, "\"EXCELLENT\"");
    }
}

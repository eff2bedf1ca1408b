//! Audit sink
//!
//! Records security-relevant outcomes (auth failures, policy denials, role
//! mutations, quota breaches) as append-only rows. Recording is
//! fire-and-forget; a failing sink never blocks the calling path.

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::store::{AuditRow, MetaService, TenantContext};

/// One audited action
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub organization_id: String,
    pub user_id: Option<String>,
    pub action: String,
    pub resource: String,
    pub outcome: String,
    pub detail: serde_json::Value,
}

impl AuditRecord {
    pub fn new(
        organization_id: impl Into<String>,
        action: impl Into<String>,
        resource: impl Into<String>,
        outcome: impl Into<String>,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            user_id: None,
            action: action.into(),
            resource: resource.into(),
            outcome: outcome.into(),
            detail: serde_json::Value::Null,
        }
    }

    pub fn user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

/// Destination for audit records
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord);
}

/// Store-backed audit sink
pub struct StoreAuditSink {
    store: MetaService,
    enabled: bool,
}

impl StoreAuditSink {
    pub fn new(store: MetaService, enabled: bool) -> Self {
        Self { store, enabled }
    }
}

#[async_trait]
impl AuditSink for StoreAuditSink {
    async fn record(&self, record: AuditRecord) {
        if !self.enabled {
            return;
        }
        let row = AuditRow {
            id: Uuid::new_v4().to_string(),
            organization_id: record.organization_id.clone(),
            user_id: record.user_id,
            action: record.action,
            resource: record.resource,
            outcome: record.outcome,
            detail: record.detail,
            created_at: Utc::now(),
        };
        let ctx = TenantContext::tenant(&record.organization_id);
        if let Err(e) = self.store.append_audit(&ctx, &row).await {
            tracing::warn!(error = %e, action = %row.action, "Failed to write audit row");
        }
    }
}

/// Sink that drops everything (tests, audit disabled)
pub struct NoopAuditSink;

#[async_trait]
impl AuditSink for NoopAuditSink {
    async fn record(&self, _record: AuditRecord) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_builder() {
        let record = AuditRecord::new("org-a", "role.create", "role:Ops", "conflict")
            .user(Some("u1".into()))
            .detail(serde_json::json!({"name": "Ops"}));
        assert_eq!(record.organization_id, "org-a");
        assert_eq!(record.user_id.as_deref(), Some("u1"));
        assert_eq!(record.outcome, "conflict");
    }

    #[tokio::test]
    async fn test_store_sink_writes_row() {
        let store = MetaService::in_memory();
        let sink = StoreAuditSink::new(store.clone(), true);
        sink.record(AuditRecord::new(
            "org-a",
            "channel.subscribe",
            "agent_events",
            "forbidden",
        ))
        .await;
        // Row lands without error; disabled sink stays silent
        let disabled = StoreAuditSink::new(store, false);
        disabled
            .record(AuditRecord::new("org-a", "x", "y", "ok"))
            .await;
    }
}

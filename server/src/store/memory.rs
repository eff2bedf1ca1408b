//! In-memory metadata store
//!
//! DashMap-backed rows for development and tests. Contents are lost on
//! restart; durability comes from the SQLite backend.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;

use super::error::StoreError;
use super::types::{
    AuditRow, ConnectionRow, ConnectionStatus, EventRow, OrganizationRow, RoleRow, UserRoleRow,
    UserRow,
};
use super::{MetaStore, TenantContext};

/// In-memory metadata store
pub struct MemoryMetaStore {
    organizations: DashMap<String, OrganizationRow>,
    users: DashMap<String, UserRow>,
    roles: DashMap<String, RoleRow>,
    /// Keyed `{user_id}:{role_id}`
    user_roles: DashMap<String, UserRoleRow>,
    connections: DashMap<String, ConnectionRow>,
    events: RwLock<Vec<EventRow>>,
    audit: RwLock<Vec<AuditRow>>,
    strict: bool,
}

impl MemoryMetaStore {
    pub fn new(strict: bool) -> Self {
        Self {
            organizations: DashMap::new(),
            users: DashMap::new(),
            roles: DashMap::new(),
            user_roles: DashMap::new(),
            connections: DashMap::new(),
            events: RwLock::new(Vec::new()),
            audit: RwLock::new(Vec::new()),
            strict,
        }
    }

    fn guard(
        &self,
        ctx: &TenantContext,
        entity: &'static str,
        organization_id: &str,
        id: &str,
    ) -> Result<(), StoreError> {
        if self.strict {
            ctx.check(entity, organization_id, id)
        } else {
            Ok(())
        }
    }

    fn assignment_key(user_id: &str, role_id: &str) -> String {
        format!("{user_id}:{role_id}")
    }
}

#[async_trait]
impl MetaStore for MemoryMetaStore {
    async fn upsert_organization(&self, row: &OrganizationRow) -> Result<(), StoreError> {
        self.organizations.insert(row.id.clone(), row.clone());
        Ok(())
    }

    async fn find_organization(&self, id: &str) -> Result<Option<OrganizationRow>, StoreError> {
        Ok(self.organizations.get(id).map(|r| r.clone()))
    }

    async fn delete_organization(&self, id: &str) -> Result<(), StoreError> {
        self.organizations
            .remove(id)
            .ok_or_else(|| StoreError::not_found("organization", id))?;

        // Cascade to tenant-owned rows
        let doomed_users: Vec<String> = self
            .users
            .iter()
            .filter(|u| u.organization_id == id)
            .map(|u| u.id.clone())
            .collect();
        let doomed_roles: Vec<String> = self
            .roles
            .iter()
            .filter(|r| r.organization_id == id)
            .map(|r| r.id.clone())
            .collect();

        self.user_roles.retain(|_, ur| {
            !doomed_users.contains(&ur.user_id) && !doomed_roles.contains(&ur.role_id)
        });
        for user_id in &doomed_users {
            self.users.remove(user_id);
        }
        for role_id in &doomed_roles {
            self.roles.remove(role_id);
        }
        self.connections.retain(|_, c| c.organization_id != id);
        self.events.write().retain(|e| e.organization_id != id);
        self.audit.write().retain(|a| a.organization_id != id);
        Ok(())
    }

    async fn upsert_user(&self, ctx: &TenantContext, row: &UserRow) -> Result<(), StoreError> {
        self.guard(ctx, "user", &row.organization_id, &row.id)?;
        self.users.insert(row.id.clone(), row.clone());
        Ok(())
    }

    async fn find_user(
        &self,
        ctx: &TenantContext,
        id: &str,
    ) -> Result<Option<UserRow>, StoreError> {
        match self.users.get(id) {
            Some(row) if !self.strict || ctx.covers(&row.organization_id) => {
                Ok(Some(row.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn insert_role(&self, ctx: &TenantContext, row: &RoleRow) -> Result<(), StoreError> {
        self.guard(ctx, "role", &row.organization_id, &row.id)?;
        let collision = self.roles.iter().any(|r| {
            r.organization_id == row.organization_id && r.name == row.name && r.id != row.id
        });
        if collision {
            return Err(StoreError::Conflict(format!(
                "role '{}' already exists in organization {}",
                row.name, row.organization_id
            )));
        }
        self.roles.insert(row.id.clone(), row.clone());
        Ok(())
    }

    async fn update_role(&self, ctx: &TenantContext, row: &RoleRow) -> Result<(), StoreError> {
        self.guard(ctx, "role", &row.organization_id, &row.id)?;
        if !self.roles.contains_key(&row.id) {
            return Err(StoreError::not_found("role", &row.id));
        }
        let collision = self.roles.iter().any(|r| {
            r.organization_id == row.organization_id && r.name == row.name && r.id != row.id
        });
        if collision {
            return Err(StoreError::Conflict(format!(
                "role '{}' already exists in organization {}",
                row.name, row.organization_id
            )));
        }
        self.roles.insert(row.id.clone(), row.clone());
        Ok(())
    }

    async fn delete_role(&self, ctx: &TenantContext, id: &str) -> Result<(), StoreError> {
        let Some(row) = self.roles.get(id).map(|r| r.clone()) else {
            return Err(StoreError::not_found("role", id));
        };
        self.guard(ctx, "role", &row.organization_id, id)?;
        self.roles.remove(id);
        self.user_roles.retain(|_, ur| ur.role_id != id);
        Ok(())
    }

    async fn find_role(
        &self,
        ctx: &TenantContext,
        id: &str,
    ) -> Result<Option<RoleRow>, StoreError> {
        match self.roles.get(id) {
            Some(row) if !self.strict || ctx.covers(&row.organization_id) => Ok(Some(row.clone())),
            _ => Ok(None),
        }
    }

    async fn find_role_by_name(
        &self,
        ctx: &TenantContext,
        organization_id: &str,
        name: &str,
    ) -> Result<Option<RoleRow>, StoreError> {
        self.guard(ctx, "role", organization_id, name)?;
        Ok(self
            .roles
            .iter()
            .find(|r| r.organization_id == organization_id && r.name == name)
            .map(|r| r.clone()))
    }

    async fn list_roles(
        &self,
        ctx: &TenantContext,
        organization_id: &str,
    ) -> Result<Vec<RoleRow>, StoreError> {
        self.guard(ctx, "role", organization_id, "*")?;
        Ok(self
            .roles
            .iter()
            .filter(|r| r.organization_id == organization_id)
            .map(|r| r.clone())
            .collect())
    }

    async fn insert_user_role(
        &self,
        _ctx: &TenantContext,
        row: &UserRoleRow,
    ) -> Result<(), StoreError> {
        let key = Self::assignment_key(&row.user_id, &row.role_id);
        if self.user_roles.contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "role {} already assigned to user {}",
                row.role_id, row.user_id
            )));
        }
        self.user_roles.insert(key, row.clone());
        Ok(())
    }

    async fn delete_user_role(
        &self,
        _ctx: &TenantContext,
        user_id: &str,
        role_id: &str,
    ) -> Result<(), StoreError> {
        let key = Self::assignment_key(user_id, role_id);
        self.user_roles
            .remove(&key)
            .ok_or_else(|| StoreError::not_found("user_role", key.clone()))?;
        Ok(())
    }

    async fn list_user_roles(
        &self,
        _ctx: &TenantContext,
        user_id: &str,
    ) -> Result<Vec<UserRoleRow>, StoreError> {
        Ok(self
            .user_roles
            .iter()
            .filter(|ur| ur.user_id == user_id)
            .map(|ur| ur.clone())
            .collect())
    }

    async fn upsert_connection(
        &self,
        ctx: &TenantContext,
        row: &ConnectionRow,
    ) -> Result<(), StoreError> {
        self.guard(ctx, "connection", &row.organization_id, &row.session_id)?;
        self.connections.insert(row.session_id.clone(), row.clone());
        Ok(())
    }

    async fn find_connection(
        &self,
        ctx: &TenantContext,
        session_id: &str,
    ) -> Result<Option<ConnectionRow>, StoreError> {
        match self.connections.get(session_id) {
            Some(row) if !self.strict || ctx.covers(&row.organization_id) => Ok(Some(row.clone())),
            _ => Ok(None),
        }
    }

    async fn delete_connection(
        &self,
        ctx: &TenantContext,
        session_id: &str,
    ) -> Result<(), StoreError> {
        if let Some(row) = self.connections.get(session_id).map(|r| r.clone()) {
            self.guard(ctx, "connection", &row.organization_id, session_id)?;
            self.connections.remove(session_id);
        }
        Ok(())
    }

    async fn list_connections_by_org(
        &self,
        ctx: &TenantContext,
        organization_id: &str,
    ) -> Result<Vec<ConnectionRow>, StoreError> {
        self.guard(ctx, "connection", organization_id, "*")?;
        Ok(self
            .connections
            .iter()
            .filter(|c| c.organization_id == organization_id)
            .map(|c| c.clone())
            .collect())
    }

    async fn list_connections_by_status(
        &self,
        ctx: &TenantContext,
        statuses: &[ConnectionStatus],
    ) -> Result<Vec<ConnectionRow>, StoreError> {
        Ok(self
            .connections
            .iter()
            .filter(|c| statuses.contains(&c.status) && ctx.covers(&c.organization_id))
            .map(|c| c.clone())
            .collect())
    }

    async fn insert_event(&self, ctx: &TenantContext, row: &EventRow) -> Result<(), StoreError> {
        self.guard(ctx, "event", &row.organization_id, &row.id)?;
        self.events.write().push(row.clone());
        Ok(())
    }

    async fn append_audit(&self, ctx: &TenantContext, row: &AuditRow) -> Result<(), StoreError> {
        self.guard(ctx, "audit", &row.organization_id, &row.id)?;
        self.audit.write().push(row.clone());
        Ok(())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::types::RoleLevel;
    use chrono::Utc;

    fn org(id: &str) -> OrganizationRow {
        OrganizationRow {
            id: id.to_string(),
            slug: id.to_string(),
            max_users: 10,
            max_connections: 10,
            max_events: 100,
            max_channels: 10,
            max_storage: 0,
            max_api_calls: 1000,
            features: vec![],
            settings: serde_json::json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn role(id: &str, org: &str, name: &str) -> RoleRow {
        RoleRow {
            id: id.to_string(),
            organization_id: org.to_string(),
            name: name.to_string(),
            permissions: vec!["channel:read".into()],
            level: RoleLevel::Developer,
            is_system: false,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn connection(session: &str, org: &str) -> ConnectionRow {
        ConnectionRow {
            session_id: session.to_string(),
            organization_id: org.to_string(),
            user_id: None,
            client_type: crate::store::types::ClientType::ApiClient,
            status: ConnectionStatus::Connected,
            connected_at: Utc::now(),
            last_heartbeat: Utc::now(),
            disconnected_at: None,
            reconnect_attempts: 0,
            max_reconnect_attempts: 5,
            next_reconnect_at: None,
            quality: crate::store::types::ConnectionQuality::Excellent,
            latency_ms: 0.0,
            missed_heartbeats: 0,
            total_disconnections: 0,
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn test_role_name_conflict_scoped_to_org() {
        let store = MemoryMetaStore::new(true);
        let ctx_a = TenantContext::tenant("org-a");
        let ctx_b = TenantContext::tenant("org-b");

        store
            .insert_role(&ctx_a, &role("r1", "org-a", "Ops"))
            .await
            .unwrap();

        // Same name, same org: conflict
        let err = store
            .insert_role(&ctx_a, &role("r2", "org-a", "Ops"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // Same name, different org: fine
        store
            .insert_role(&ctx_b, &role("r3", "org-b", "Ops"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_tenant_isolation_on_reads() {
        let store = MemoryMetaStore::new(true);
        let ctx_a = TenantContext::tenant("org-a");
        let ctx_b = TenantContext::tenant("org-b");

        store
            .upsert_connection(&ctx_a, &connection("s1", "org-a"))
            .await
            .unwrap();

        assert!(
            store
                .find_connection(&ctx_a, "s1")
                .await
                .unwrap()
                .is_some()
        );
        // Another tenant cannot see it
        assert!(
            store
                .find_connection(&ctx_b, "s1")
                .await
                .unwrap()
                .is_none()
        );
        // System context can
        assert!(
            store
                .find_connection(&TenantContext::system(), "s1")
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_cross_tenant_write_rejected() {
        let store = MemoryMetaStore::new(true);
        let ctx_b = TenantContext::tenant("org-b");
        let err = store
            .upsert_connection(&ctx_b, &connection("s1", "org-a"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IsolationViolation { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_assignment_conflict() {
        let store = MemoryMetaStore::new(true);
        let ctx = TenantContext::tenant("org-a");
        let assignment = UserRoleRow {
            user_id: "u1".into(),
            role_id: "r1".into(),
            scope: None,
            expires_at: None,
            is_active: true,
            created_at: Utc::now(),
        };
        store.insert_user_role(&ctx, &assignment).await.unwrap();
        let err = store.insert_user_role(&ctx, &assignment).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_delete_organization_cascades() {
        let store = MemoryMetaStore::new(true);
        let ctx = TenantContext::tenant("org-a");

        store.upsert_organization(&org("org-a")).await.unwrap();
        store
            .insert_role(&ctx, &role("r1", "org-a", "Ops"))
            .await
            .unwrap();
        store
            .upsert_connection(&ctx, &connection("s1", "org-a"))
            .await
            .unwrap();

        store.delete_organization("org-a").await.unwrap();

        assert!(store.find_role(&ctx, "r1").await.unwrap().is_none());
        assert!(
            store
                .find_connection(&TenantContext::system(), "s1")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_list_connections_by_status() {
        let store = MemoryMetaStore::new(true);
        let ctx = TenantContext::tenant("org-a");
        let mut c1 = connection("s1", "org-a");
        c1.status = ConnectionStatus::Connected;
        let mut c2 = connection("s2", "org-a");
        c2.status = ConnectionStatus::Failed;
        store.upsert_connection(&ctx, &c1).await.unwrap();
        store.upsert_connection(&ctx, &c2).await.unwrap();

        let rows = store
            .list_connections_by_status(
                &TenantContext::system(),
                &[ConnectionStatus::Connected, ConnectionStatus::Reconnecting],
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].session_id, "s1");
    }
}

//! Tenant-aware metadata store
//!
//! Durable rows for organizations, users, roles, connections, events and
//! audit entries, behind a pluggable backend:
//! - In-memory (default) - local-only, for development and tests
//! - SQLite (optional) - durable single-node deployments
//!
//! Every call takes a [`TenantContext`]; in strict-isolation mode backends
//! reject reads and writes whose context does not cover the row's
//! `organization_id`. The system context (used by startup recovery and
//! internal sweeps) covers all tenants.

mod error;
mod memory;
mod sqlite;
pub mod types;

use std::sync::Arc;

use async_trait::async_trait;

pub use error::StoreError;
pub use types::{
    AuditRow, ClientType, ConnectionQuality, ConnectionRow, ConnectionStatus, EventRow,
    OrganizationRow, RoleLevel, RoleRow, UserRoleRow, UserRow,
};

use crate::core::config::{StoreBackendType, StoreConfig};
use memory::MemoryMetaStore;
use sqlite::SqliteMetaStore;

// =============================================================================
// TENANT CONTEXT
// =============================================================================

/// The tenant on whose behalf a store call runs
///
/// Threaded through every call into the store; replaces ambient global
/// state so isolation is checkable at the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantContext {
    /// Internal caller; covers all tenants (recovery, sweepers)
    System,
    /// A specific organization
    Tenant(String),
}

impl TenantContext {
    pub fn system() -> Self {
        TenantContext::System
    }

    pub fn tenant(organization_id: impl Into<String>) -> Self {
        TenantContext::Tenant(organization_id.into())
    }

    /// The organization this context is scoped to, if any
    pub fn organization_id(&self) -> Option<&str> {
        match self {
            TenantContext::System => None,
            TenantContext::Tenant(org) => Some(org),
        }
    }

    /// Whether this context may touch rows of the given organization
    pub fn covers(&self, organization_id: &str) -> bool {
        match self {
            TenantContext::System => true,
            TenantContext::Tenant(org) => org == organization_id,
        }
    }

    /// Reject access to a row owned by another tenant
    pub fn check(
        &self,
        entity: &'static str,
        row_organization_id: &str,
        row_id: &str,
    ) -> Result<(), StoreError> {
        if self.covers(row_organization_id) {
            Ok(())
        } else {
            Err(StoreError::IsolationViolation {
                entity,
                id: row_id.to_string(),
            })
        }
    }
}

// =============================================================================
// METASTORE TRAIT
// =============================================================================

/// Metadata store backend
///
/// All mutations are upserts or append-only inserts; uniqueness violations
/// surface as [`StoreError::Conflict`]. Backends enforce tenant isolation
/// against the supplied context when constructed in strict mode.
#[async_trait]
pub trait MetaStore: Send + Sync {
    // Organizations (system-scoped; deletion cascades to owned rows)
    async fn upsert_organization(&self, row: &OrganizationRow) -> Result<(), StoreError>;
    async fn find_organization(&self, id: &str) -> Result<Option<OrganizationRow>, StoreError>;
    async fn delete_organization(&self, id: &str) -> Result<(), StoreError>;

    // Users
    async fn upsert_user(&self, ctx: &TenantContext, row: &UserRow) -> Result<(), StoreError>;
    async fn find_user(
        &self,
        ctx: &TenantContext,
        id: &str,
    ) -> Result<Option<UserRow>, StoreError>;

    // Roles
    async fn insert_role(&self, ctx: &TenantContext, row: &RoleRow) -> Result<(), StoreError>;
    async fn update_role(&self, ctx: &TenantContext, row: &RoleRow) -> Result<(), StoreError>;
    async fn delete_role(&self, ctx: &TenantContext, id: &str) -> Result<(), StoreError>;
    async fn find_role(
        &self,
        ctx: &TenantContext,
        id: &str,
    ) -> Result<Option<RoleRow>, StoreError>;
    async fn find_role_by_name(
        &self,
        ctx: &TenantContext,
        organization_id: &str,
        name: &str,
    ) -> Result<Option<RoleRow>, StoreError>;
    async fn list_roles(
        &self,
        ctx: &TenantContext,
        organization_id: &str,
    ) -> Result<Vec<RoleRow>, StoreError>;

    // Role assignments
    async fn insert_user_role(
        &self,
        ctx: &TenantContext,
        row: &UserRoleRow,
    ) -> Result<(), StoreError>;
    async fn delete_user_role(
        &self,
        ctx: &TenantContext,
        user_id: &str,
        role_id: &str,
    ) -> Result<(), StoreError>;
    async fn list_user_roles(
        &self,
        ctx: &TenantContext,
        user_id: &str,
    ) -> Result<Vec<UserRoleRow>, StoreError>;

    // Connections
    async fn upsert_connection(
        &self,
        ctx: &TenantContext,
        row: &ConnectionRow,
    ) -> Result<(), StoreError>;
    async fn find_connection(
        &self,
        ctx: &TenantContext,
        session_id: &str,
    ) -> Result<Option<ConnectionRow>, StoreError>;
    async fn delete_connection(
        &self,
        ctx: &TenantContext,
        session_id: &str,
    ) -> Result<(), StoreError>;
    async fn list_connections_by_org(
        &self,
        ctx: &TenantContext,
        organization_id: &str,
    ) -> Result<Vec<ConnectionRow>, StoreError>;
    async fn list_connections_by_status(
        &self,
        ctx: &TenantContext,
        statuses: &[ConnectionStatus],
    ) -> Result<Vec<ConnectionRow>, StoreError>;

    // Events (append-only)
    async fn insert_event(&self, ctx: &TenantContext, row: &EventRow) -> Result<(), StoreError>;

    // Audit (append-only)
    async fn append_audit(&self, ctx: &TenantContext, row: &AuditRow) -> Result<(), StoreError>;

    // Health and metadata
    async fn health_check(&self) -> Result<(), StoreError>;
    fn backend_name(&self) -> &'static str;

    /// Flush and release backend resources; called once during shutdown
    async fn close(&self) {}
}

// =============================================================================
// META SERVICE
// =============================================================================

/// Central handle to the configured store backend
#[derive(Clone)]
pub struct MetaService {
    backend: Arc<dyn MetaStore>,
}

impl MetaService {
    /// Create from configuration
    pub async fn from_config(
        config: &StoreConfig,
        strict_isolation: bool,
    ) -> Result<Self, StoreError> {
        let backend: Arc<dyn MetaStore> = match config.backend {
            StoreBackendType::Memory => Arc::new(MemoryMetaStore::new(strict_isolation)),
            StoreBackendType::Sqlite => {
                let path = config
                    .path
                    .as_ref()
                    .ok_or_else(|| StoreError::Config("store.path required for sqlite".into()))?;
                Arc::new(SqliteMetaStore::connect(path, strict_isolation).await?)
            }
        };
        Ok(Self { backend })
    }

    /// In-memory store for tests and single-process development
    pub fn in_memory() -> Self {
        Self {
            backend: Arc::new(MemoryMetaStore::new(true)),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }
}

impl std::ops::Deref for MetaService {
    type Target = dyn MetaStore;

    fn deref(&self) -> &Self::Target {
        self.backend.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_context_coverage() {
        let system = TenantContext::system();
        assert!(system.covers("org-a"));
        assert!(system.organization_id().is_none());

        let tenant = TenantContext::tenant("org-a");
        assert!(tenant.covers("org-a"));
        assert!(!tenant.covers("org-b"));
        assert_eq!(tenant.organization_id(), Some("org-a"));
    }

    #[test]
    fn test_tenant_context_check() {
        let tenant = TenantContext::tenant("org-a");
        assert!(tenant.check("connection", "org-a", "s1").is_ok());
        let err = tenant.check("connection", "org-b", "s1").unwrap_err();
        assert!(matches!(err, StoreError::IsolationViolation { .. }));
    }
}

//! Role management and permission evaluation
//!
//! Permission strings follow `resource:action` with `*` wildcards
//! (`*:*`, `channel:*`). Roles are org-scoped rows with unique names;
//! system roles are immutable and undeletable. The [`PolicyEngine`]
//! evaluates a principal's direct grants first, then the grants of its
//! named roles.

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{AuthError, Principal};
use crate::store::{
    MetaService, RoleLevel, RoleRow, StoreError, TenantContext, UserRoleRow,
};

// =============================================================================
// Permission matching
// =============================================================================

/// Match a granted permission pattern against a required `resource:action`
pub fn permission_matches(granted: &str, required: &str) -> bool {
    if granted == "*:*" || granted == "*" {
        return true;
    }
    let Some((granted_resource, granted_action)) = granted.split_once(':') else {
        return false;
    };
    let Some((required_resource, required_action)) = required.split_once(':') else {
        return false;
    };
    (granted_resource == "*" || granted_resource == required_resource)
        && (granted_action == "*" || granted_action == required_action)
}

/// Whether any grant in the list covers the required permission
pub fn any_permission_matches(granted: &[String], required: &str) -> bool {
    granted.iter().any(|g| permission_matches(g, required))
}

// =============================================================================
// Policy engine
// =============================================================================

/// Authorization decision point
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    /// Check `permission` (a `resource:action` string) for the principal;
    /// `resource_id` names the concrete object for audit purposes
    async fn authorize(
        &self,
        principal: &Principal,
        permission: &str,
        resource_id: &str,
    ) -> Result<(), AuthError>;
}

/// Store-backed RBAC policy engine
pub struct RbacPolicyEngine {
    store: MetaService,
}

impl RbacPolicyEngine {
    pub fn new(store: MetaService) -> Self {
        Self { store }
    }
}

#[async_trait]
impl PolicyEngine for RbacPolicyEngine {
    async fn authorize(
        &self,
        principal: &Principal,
        permission: &str,
        resource_id: &str,
    ) -> Result<(), AuthError> {
        if principal.has_permission(permission) {
            return Ok(());
        }

        // Fall back to role-derived grants
        let ctx = TenantContext::tenant(&principal.organization_id);
        for role_name in &principal.roles {
            if let Some(role) = self
                .store
                .find_role_by_name(&ctx, &principal.organization_id, role_name)
                .await?
                && role.is_active
                && any_permission_matches(&role.permissions, permission)
            {
                return Ok(());
            }
        }

        Err(AuthError::Forbidden(format!(
            "{permission} denied on {resource_id}"
        )))
    }
}

/// Policy engine that grants everything (dev mode, tests)
pub struct AllowAllPolicyEngine;

#[async_trait]
impl PolicyEngine for AllowAllPolicyEngine {
    async fn authorize(
        &self,
        _principal: &Principal,
        _permission: &str,
        _resource_id: &str,
    ) -> Result<(), AuthError> {
        Ok(())
    }
}

// =============================================================================
// Role service
// =============================================================================

/// Role CRUD and assignment over the metadata store
pub struct RoleService {
    store: MetaService,
}

impl RoleService {
    pub fn new(store: MetaService) -> Self {
        Self { store }
    }

    /// Create a role; name collisions within the organization are conflicts
    pub async fn create_role(
        &self,
        ctx: &TenantContext,
        organization_id: &str,
        name: &str,
        permissions: Vec<String>,
        level: RoleLevel,
    ) -> Result<RoleRow, AuthError> {
        let now = Utc::now();
        let row = RoleRow {
            id: Uuid::new_v4().to_string(),
            organization_id: organization_id.to_string(),
            name: name.to_string(),
            permissions,
            level,
            is_system: false,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        match self.store.insert_role(ctx, &row).await {
            Ok(()) => Ok(row),
            Err(StoreError::Conflict(msg)) => Err(AuthError::Conflict(msg)),
            Err(e) => Err(e.into()),
        }
    }

    /// Update a role's permissions/level/name; system roles are immutable
    pub async fn update_role(
        &self,
        ctx: &TenantContext,
        role_id: &str,
        name: Option<String>,
        permissions: Option<Vec<String>>,
        level: Option<RoleLevel>,
    ) -> Result<RoleRow, AuthError> {
        let mut role = self
            .store
            .find_role(ctx, role_id)
            .await?
            .ok_or_else(|| AuthError::not_found("role", role_id))?;
        if role.is_system {
            return Err(AuthError::Forbidden("system roles are immutable".into()));
        }

        if let Some(name) = name {
            role.name = name;
        }
        if let Some(permissions) = permissions {
            role.permissions = permissions;
        }
        if let Some(level) = level {
            role.level = level;
        }
        role.updated_at = Utc::now();

        match self.store.update_role(ctx, &role).await {
            Ok(()) => Ok(role),
            Err(StoreError::Conflict(msg)) => Err(AuthError::Conflict(msg)),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a role; system roles are undeletable
    pub async fn delete_role(&self, ctx: &TenantContext, role_id: &str) -> Result<(), AuthError> {
        let role = self
            .store
            .find_role(ctx, role_id)
            .await?
            .ok_or_else(|| AuthError::not_found("role", role_id))?;
        if role.is_system {
            return Err(AuthError::Forbidden("system roles are undeletable".into()));
        }
        self.store.delete_role(ctx, role_id).await?;
        Ok(())
    }

    /// Assign a role to a user; both must belong to the same organization
    pub async fn assign_role(
        &self,
        ctx: &TenantContext,
        user_id: &str,
        role_id: &str,
        scope: Option<String>,
        expires_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<UserRoleRow, AuthError> {
        let user = self
            .store
            .find_user(ctx, user_id)
            .await?
            .ok_or_else(|| AuthError::not_found("user", user_id))?;
        let role = self
            .store
            .find_role(ctx, role_id)
            .await?
            .ok_or_else(|| AuthError::not_found("role", role_id))?;

        if user.organization_id != role.organization_id {
            return Err(AuthError::Forbidden(
                "user and role belong to different organizations".into(),
            ));
        }

        let row = UserRoleRow {
            user_id: user_id.to_string(),
            role_id: role_id.to_string(),
            scope,
            expires_at,
            is_active: true,
            created_at: Utc::now(),
        };
        match self.store.insert_user_role(ctx, &row).await {
            Ok(()) => Ok(row),
            Err(StoreError::Conflict(msg)) => Err(AuthError::Conflict(msg)),
            Err(e) => Err(e.into()),
        }
    }

    /// Revoke a role assignment
    pub async fn revoke_role(
        &self,
        ctx: &TenantContext,
        user_id: &str,
        role_id: &str,
    ) -> Result<(), AuthError> {
        match self.store.delete_user_role(ctx, user_id, role_id).await {
            Ok(()) => Ok(()),
            Err(StoreError::NotFound { entity, id }) => Err(AuthError::NotFound { entity, id }),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::UserRow;

    #[test]
    fn test_permission_wildcards() {
        assert!(permission_matches("*:*", "channel:read"));
        assert!(permission_matches("channel:*", "channel:read"));
        assert!(permission_matches("channel:read", "channel:read"));
        assert!(permission_matches("*:read", "channel:read"));
        assert!(!permission_matches("channel:write", "channel:read"));
        assert!(!permission_matches("queue:*", "channel:read"));
        assert!(!permission_matches("malformed", "channel:read"));
    }

    fn user(id: &str, org: &str) -> UserRow {
        UserRow {
            id: id.to_string(),
            organization_id: org.to_string(),
            email: format!("{id}@example.com"),
            password_hash: "x".into(),
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_role_conflict_and_cross_org_success() {
        let store = MetaService::in_memory();
        let service = RoleService::new(store);
        let ctx_a = TenantContext::tenant("org-a");
        let ctx_b = TenantContext::tenant("org-b");

        service
            .create_role(&ctx_a, "org-a", "Ops", vec![], RoleLevel::Developer)
            .await
            .unwrap();

        let err = service
            .create_role(&ctx_a, "org-a", "Ops", vec![], RoleLevel::Developer)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Conflict(_)));

        // Same name in another org succeeds
        service
            .create_role(&ctx_b, "org-b", "Ops", vec![], RoleLevel::Developer)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_system_role_is_immutable_and_undeletable() {
        let store = MetaService::in_memory();
        let ctx = TenantContext::tenant("org-a");
        let now = Utc::now();
        let system_role = RoleRow {
            id: "sys-1".into(),
            organization_id: "org-a".into(),
            name: "Admin".into(),
            permissions: vec!["*:*".into()],
            level: RoleLevel::OrgAdmin,
            is_system: true,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        store.insert_role(&ctx, &system_role).await.unwrap();

        let service = RoleService::new(store.clone());
        let err = service
            .update_role(&ctx, "sys-1", None, Some(vec![]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Forbidden(_)));

        let err = service.delete_role(&ctx, "sys-1").await.unwrap_err();
        assert!(matches!(err, AuthError::Forbidden(_)));

        // Row unchanged
        let row = store.find_role(&ctx, "sys-1").await.unwrap().unwrap();
        assert_eq!(row, system_role);
    }

    #[tokio::test]
    async fn test_cross_org_assignment_rejected() {
        let store = MetaService::in_memory();
        let ctx = TenantContext::system();
        store.upsert_user(&ctx, &user("u-b", "org-b")).await.unwrap();

        let service = RoleService::new(store.clone());
        let role = service
            .create_role(
                &TenantContext::tenant("org-a"),
                "org-a",
                "Ops",
                vec![],
                RoleLevel::Developer,
            )
            .await
            .unwrap();

        // Assigning an org-a role to an org-b user fails
        let err = service
            .assign_role(&ctx, "u-b", &role.id, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Forbidden(_)));

        // Through a tenant-scoped context the foreign role is simply absent
        let err = service
            .assign_role(&TenantContext::tenant("org-b"), "u-b", &role.id, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_assignment_is_conflict() {
        let store = MetaService::in_memory();
        let ctx = TenantContext::tenant("org-a");
        store.upsert_user(&ctx, &user("u1", "org-a")).await.unwrap();

        let service = RoleService::new(store);
        let role = service
            .create_role(&ctx, "org-a", "Ops", vec![], RoleLevel::Developer)
            .await
            .unwrap();

        service
            .assign_role(&ctx, "u1", &role.id, None, None)
            .await
            .unwrap();
        let err = service
            .assign_role(&ctx, "u1", &role.id, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_policy_engine_uses_role_grants() {
        let store = MetaService::in_memory();
        let ctx = TenantContext::tenant("org-a");
        RoleService::new(store.clone())
            .create_role(
                &ctx,
                "org-a",
                "Reader",
                vec!["channel:read".into()],
                RoleLevel::Viewer,
            )
            .await
            .unwrap();

        let engine = RbacPolicyEngine::new(store);
        let principal = Principal {
            organization_id: "org-a".into(),
            user_id: Some("u1".into()),
            roles: vec!["Reader".into()],
            permissions: vec![],
        };

        engine
            .authorize(&principal, "channel:read", "agent_events")
            .await
            .unwrap();
        let err = engine
            .authorize(&principal, "channel:write", "agent_events")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Forbidden(_)));
    }
}

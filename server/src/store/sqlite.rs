//! SQLite metadata store
//!
//! Durable single-node backend. Schema is applied idempotently at connect
//! time; JSON-valued columns are stored as TEXT, timestamps as epoch
//! milliseconds. Organization deletion cascades inside one transaction so
//! no tenant row outlives its organization.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use super::error::StoreError;
use super::types::{
    AuditRow, ClientType, ConnectionQuality, ConnectionRow, ConnectionStatus, EventRow,
    OrganizationRow, RoleLevel, RoleRow, UserRoleRow, UserRow,
};
use super::{MetaStore, TenantContext};

/// Schema applied at connect; additive and idempotent
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS organizations (
    id TEXT PRIMARY KEY,
    slug TEXT NOT NULL UNIQUE,
    max_users INTEGER NOT NULL,
    max_connections INTEGER NOT NULL,
    max_events INTEGER NOT NULL,
    max_channels INTEGER NOT NULL,
    max_storage INTEGER NOT NULL,
    max_api_calls INTEGER NOT NULL,
    features TEXT NOT NULL,
    settings TEXT NOT NULL,
    created_at BIGINT NOT NULL,
    updated_at BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    organization_id TEXT NOT NULL,
    email TEXT NOT NULL,
    password_hash TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at BIGINT NOT NULL,
    updated_at BIGINT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_users_org ON users(organization_id);

CREATE TABLE IF NOT EXISTS roles (
    id TEXT PRIMARY KEY,
    organization_id TEXT NOT NULL,
    name TEXT NOT NULL,
    permissions TEXT NOT NULL,
    level TEXT NOT NULL,
    is_system INTEGER NOT NULL DEFAULT 0,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at BIGINT NOT NULL,
    updated_at BIGINT NOT NULL,
    UNIQUE(organization_id, name)
);

CREATE TABLE IF NOT EXISTS user_roles (
    user_id TEXT NOT NULL,
    role_id TEXT NOT NULL,
    scope TEXT,
    expires_at BIGINT,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at BIGINT NOT NULL,
    PRIMARY KEY (user_id, role_id)
);

CREATE TABLE IF NOT EXISTS connections (
    session_id TEXT PRIMARY KEY,
    organization_id TEXT NOT NULL,
    user_id TEXT,
    client_type TEXT NOT NULL,
    status TEXT NOT NULL,
    connected_at BIGINT NOT NULL,
    last_heartbeat BIGINT NOT NULL,
    disconnected_at BIGINT,
    reconnect_attempts INTEGER NOT NULL DEFAULT 0,
    max_reconnect_attempts INTEGER NOT NULL,
    next_reconnect_at BIGINT,
    quality TEXT NOT NULL,
    latency_ms REAL NOT NULL DEFAULT 0,
    missed_heartbeats INTEGER NOT NULL DEFAULT 0,
    total_disconnections INTEGER NOT NULL DEFAULT 0,
    metadata TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_connections_org ON connections(organization_id);
CREATE INDEX IF NOT EXISTS idx_connections_status ON connections(status);

CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    event_type TEXT NOT NULL,
    channel TEXT NOT NULL,
    payload TEXT NOT NULL,
    organization_id TEXT NOT NULL,
    user_id TEXT,
    session_id TEXT,
    acknowledgment INTEGER NOT NULL DEFAULT 0,
    retry_count INTEGER NOT NULL DEFAULT 0,
    created_at BIGINT NOT NULL,
    metadata TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_org_channel ON events(organization_id, channel);

CREATE TABLE IF NOT EXISTS audit_log (
    id TEXT PRIMARY KEY,
    organization_id TEXT NOT NULL,
    user_id TEXT,
    action TEXT NOT NULL,
    resource TEXT NOT NULL,
    outcome TEXT NOT NULL,
    detail TEXT NOT NULL,
    created_at BIGINT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_org ON audit_log(organization_id, created_at);
"#;

/// SQLite metadata store
pub struct SqliteMetaStore {
    pool: SqlitePool,
    strict: bool,
}

impl SqliteMetaStore {
    /// Open (creating if missing) the database and apply the schema
    pub async fn connect(path: &Path, strict: bool) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(StoreError::Sqlite)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        tracing::debug!(path = %path.display(), "SQLite metadata store ready");

        Ok(Self { pool, strict })
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
}

fn millis(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

fn json_text(value: &serde_json::Value) -> String {
    value.to_string()
}

fn parse_json(text: &str) -> serde_json::Value {
    serde_json::from_str(text).unwrap_or(serde_json::Value::Null)
}

fn string_list_text(list: &[String]) -> Result<String, StoreError> {
    serde_json::to_string(list).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn parse_string_list(text: &str) -> Vec<String> {
    serde_json::from_str(text).unwrap_or_default()
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|d| d.is_unique_violation())
        .unwrap_or(false)
}

fn row_to_organization(row: &SqliteRow) -> OrganizationRow {
    OrganizationRow {
        id: row.get("id"),
        slug: row.get("slug"),
        max_users: row.get::<i64, _>("max_users") as u64,
        max_connections: row.get::<i64, _>("max_connections") as u64,
        max_events: row.get::<i64, _>("max_events") as u64,
        max_channels: row.get::<i64, _>("max_channels") as u64,
        max_storage: row.get::<i64, _>("max_storage") as u64,
        max_api_calls: row.get::<i64, _>("max_api_calls") as u64,
        features: parse_string_list(row.get::<String, _>("features").as_str()),
        settings: parse_json(row.get::<String, _>("settings").as_str()),
        created_at: from_millis(row.get("created_at")),
        updated_at: from_millis(row.get("updated_at")),
    }
}

fn row_to_user(row: &SqliteRow) -> UserRow {
    UserRow {
        id: row.get("id"),
        organization_id: row.get("organization_id"),
        email: row.get("email"),
        password_hash: row.get("password_hash"),
        is_active: row.get::<i64, _>("is_active") != 0,
        created_at: from_millis(row.get("created_at")),
        updated_at: from_millis(row.get("updated_at")),
    }
}

fn row_to_role(row: &SqliteRow) -> RoleRow {
    RoleRow {
        id: row.get("id"),
        organization_id: row.get("organization_id"),
        name: row.get("name"),
        permissions: parse_string_list(row.get::<String, _>("permissions").as_str()),
        level: RoleLevel::parse(row.get::<String, _>("level").as_str())
            .unwrap_or(RoleLevel::Viewer),
        is_system: row.get::<i64, _>("is_system") != 0,
        is_active: row.get::<i64, _>("is_active") != 0,
        created_at: from_millis(row.get("created_at")),
        updated_at: from_millis(row.get("updated_at")),
    }
}

fn row_to_user_role(row: &SqliteRow) -> UserRoleRow {
    UserRoleRow {
        user_id: row.get("user_id"),
        role_id: row.get("role_id"),
        scope: row.get("scope"),
        expires_at: row.get::<Option<i64>, _>("expires_at").map(from_millis),
        is_active: row.get::<i64, _>("is_active") != 0,
        created_at: from_millis(row.get("created_at")),
    }
}

fn row_to_connection(row: &SqliteRow) -> ConnectionRow {
    let client_type: String = row.get("client_type");
    let client_type: ClientType =
        serde_json::from_value(serde_json::Value::String(client_type))
            .unwrap_or(ClientType::ApiClient);
    ConnectionRow {
        session_id: row.get("session_id"),
        organization_id: row.get("organization_id"),
        user_id: row.get("user_id"),
        client_type,
        status: ConnectionStatus::parse(row.get::<String, _>("status").as_str())
            .unwrap_or(ConnectionStatus::Disconnected),
        connected_at: from_millis(row.get("connected_at")),
        last_heartbeat: from_millis(row.get("last_heartbeat")),
        disconnected_at: row.get::<Option<i64>, _>("disconnected_at").map(from_millis),
        reconnect_attempts: row.get::<i64, _>("reconnect_attempts") as u32,
        max_reconnect_attempts: row.get::<i64, _>("max_reconnect_attempts") as u32,
        next_reconnect_at: row
            .get::<Option<i64>, _>("next_reconnect_at")
            .map(from_millis),
        quality: ConnectionQuality::parse(row.get::<String, _>("quality").as_str())
            .unwrap_or(ConnectionQuality::Good),
        latency_ms: row.get("latency_ms"),
        missed_heartbeats: row.get::<i64, _>("missed_heartbeats") as u32,
        total_disconnections: row.get::<i64, _>("total_disconnections") as u32,
        metadata: parse_json(row.get::<String, _>("metadata").as_str()),
    }
}

#[async_trait]
impl MetaStore for SqliteMetaStore {
    async fn upsert_organization(&self, row: &OrganizationRow) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO organizations \
             (id, slug, max_users, max_connections, max_events, max_channels, max_storage, \
              max_api_calls, features, settings, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12) \
             ON CONFLICT(id) DO UPDATE SET \
               slug = excluded.slug, max_users = excluded.max_users, \
               max_connections = excluded.max_connections, max_events = excluded.max_events, \
               max_channels = excluded.max_channels, max_storage = excluded.max_storage, \
               max_api_calls = excluded.max_api_calls, features = excluded.features, \
               settings = excluded.settings, updated_at = excluded.updated_at",
        )
        .bind(&row.id)
        .bind(&row.slug)
        .bind(row.max_users as i64)
        .bind(row.max_connections as i64)
        .bind(row.max_events as i64)
        .bind(row.max_channels as i64)
        .bind(row.max_storage as i64)
        .bind(row.max_api_calls as i64)
        .bind(string_list_text(&row.features)?)
        .bind(json_text(&row.settings))
        .bind(millis(&row.created_at))
        .bind(millis(&row.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_organization(&self, id: &str) -> Result<Option<OrganizationRow>, StoreError> {
        let row = sqlx::query("SELECT * FROM organizations WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_organization))
    }

    async fn delete_organization(&self, id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query("DELETE FROM organizations WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(StoreError::not_found("organization", id));
        }

        sqlx::query(
            "DELETE FROM user_roles WHERE user_id IN \
             (SELECT id FROM users WHERE organization_id = ?1) \
             OR role_id IN (SELECT id FROM roles WHERE organization_id = ?1)",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;
        for table in ["users", "roles", "connections", "events", "audit_log"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE organization_id = ?1"))
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn upsert_user(&self, ctx: &TenantContext, row: &UserRow) -> Result<(), StoreError> {
        self.guard(ctx, "user", &row.organization_id, &row.id)?;
        sqlx::query(
            "INSERT INTO users (id, organization_id, email, password_hash, is_active, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT(id) DO UPDATE SET \
               email = excluded.email, password_hash = excluded.password_hash, \
               is_active = excluded.is_active, updated_at = excluded.updated_at",
        )
        .bind(&row.id)
        .bind(&row.organization_id)
        .bind(&row.email)
        .bind(&row.password_hash)
        .bind(row.is_active as i64)
        .bind(millis(&row.created_at))
        .bind(millis(&row.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_user(
        &self,
        ctx: &TenantContext,
        id: &str,
    ) -> Result<Option<UserRow>, StoreError> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .as_ref()
            .map(row_to_user)
            .filter(|u| !self.strict || ctx.covers(&u.organization_id)))
    }

    async fn insert_role(&self, ctx: &TenantContext, row: &RoleRow) -> Result<(), StoreError> {
        self.guard(ctx, "role", &row.organization_id, &row.id)?;
        let result = sqlx::query(
            "INSERT INTO roles (id, organization_id, name, permissions, level, is_system, is_active, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(&row.id)
        .bind(&row.organization_id)
        .bind(&row.name)
        .bind(string_list_text(&row.permissions)?)
        .bind(row.level.as_str())
        .bind(row.is_system as i64)
        .bind(row.is_active as i64)
        .bind(millis(&row.created_at))
        .bind(millis(&row.updated_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::Conflict(format!(
                "role '{}' already exists in organization {}",
                row.name, row.organization_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_role(&self, ctx: &TenantContext, row: &RoleRow) -> Result<(), StoreError> {
        self.guard(ctx, "role", &row.organization_id, &row.id)?;
        let result = sqlx::query(
            "UPDATE roles SET name = ?2, permissions = ?3, level = ?4, is_active = ?5, updated_at = ?6 \
             WHERE id = ?1",
        )
        .bind(&row.id)
        .bind(&row.name)
        .bind(string_list_text(&row.permissions)?)
        .bind(row.level.as_str())
        .bind(row.is_active as i64)
        .bind(millis(&row.updated_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(r) if r.rows_affected() == 0 => Err(StoreError::not_found("role", &row.id)),
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::Conflict(format!(
                "role '{}' already exists in organization {}",
                row.name, row.organization_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_role(&self, ctx: &TenantContext, id: &str) -> Result<(), StoreError> {
        let Some(existing) = self.find_role(ctx, id).await? else {
            return Err(StoreError::not_found("role", id));
        };
        self.guard(ctx, "role", &existing.organization_id, id)?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM user_roles WHERE role_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM roles WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find_role(
        &self,
        ctx: &TenantContext,
        id: &str,
    ) -> Result<Option<RoleRow>, StoreError> {
        let row = sqlx::query("SELECT * FROM roles WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .as_ref()
            .map(row_to_role)
            .filter(|r| !self.strict || ctx.covers(&r.organization_id)))
    }

    async fn find_role_by_name(
        &self,
        ctx: &TenantContext,
        organization_id: &str,
        name: &str,
    ) -> Result<Option<RoleRow>, StoreError> {
        self.guard(ctx, "role", organization_id, name)?;
        let row = sqlx::query("SELECT * FROM roles WHERE organization_id = ?1 AND name = ?2")
            .bind(organization_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_role))
    }

    async fn list_roles(
        &self,
        ctx: &TenantContext,
        organization_id: &str,
    ) -> Result<Vec<RoleRow>, StoreError> {
        self.guard(ctx, "role", organization_id, "*")?;
        let rows = sqlx::query("SELECT * FROM roles WHERE organization_id = ?1 ORDER BY name")
            .bind(organization_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_role).collect())
    }

    async fn insert_user_role(
        &self,
        _ctx: &TenantContext,
        row: &UserRoleRow,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO user_roles (user_id, role_id, scope, expires_at, is_active, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&row.user_id)
        .bind(&row.role_id)
        .bind(&row.scope)
        .bind(row.expires_at.as_ref().map(millis))
        .bind(row.is_active as i64)
        .bind(millis(&row.created_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::Conflict(format!(
                "role {} already assigned to user {}",
                row.role_id, row.user_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_user_role(
        &self,
        _ctx: &TenantContext,
        user_id: &str,
        role_id: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM user_roles WHERE user_id = ?1 AND role_id = ?2")
            .bind(user_id)
            .bind(role_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(
                "user_role",
                format!("{user_id}:{role_id}"),
            ));
        }
        Ok(())
    }

    async fn list_user_roles(
        &self,
        _ctx: &TenantContext,
        user_id: &str,
    ) -> Result<Vec<UserRoleRow>, StoreError> {
        let rows = sqlx::query("SELECT * FROM user_roles WHERE user_id = ?1")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_user_role).collect())
    }

    async fn upsert_connection(
        &self,
        ctx: &TenantContext,
        row: &ConnectionRow,
    ) -> Result<(), StoreError> {
        self.guard(ctx, "connection", &row.organization_id, &row.session_id)?;
        sqlx::query(
            "INSERT INTO connections \
             (session_id, organization_id, user_id, client_type, status, connected_at, \
              last_heartbeat, disconnected_at, reconnect_attempts, max_reconnect_attempts, \
              next_reconnect_at, quality, latency_ms, missed_heartbeats, total_disconnections, metadata) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16) \
             ON CONFLICT(session_id) DO UPDATE SET \
               status = excluded.status, last_heartbeat = excluded.last_heartbeat, \
               disconnected_at = excluded.disconnected_at, \
               reconnect_attempts = excluded.reconnect_attempts, \
               next_reconnect_at = excluded.next_reconnect_at, quality = excluded.quality, \
               latency_ms = excluded.latency_ms, missed_heartbeats = excluded.missed_heartbeats, \
               total_disconnections = excluded.total_disconnections, metadata = excluded.metadata",
        )
        .bind(&row.session_id)
        .bind(&row.organization_id)
        .bind(&row.user_id)
        .bind(row.client_type.to_string())
        .bind(row.status.as_str())
        .bind(millis(&row.connected_at))
        .bind(millis(&row.last_heartbeat))
        .bind(row.disconnected_at.as_ref().map(millis))
        .bind(row.reconnect_attempts as i64)
        .bind(row.max_reconnect_attempts as i64)
        .bind(row.next_reconnect_at.as_ref().map(millis))
        .bind(row.quality.as_str())
        .bind(row.latency_ms)
        .bind(row.missed_heartbeats as i64)
        .bind(row.total_disconnections as i64)
        .bind(json_text(&row.metadata))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_connection(
        &self,
        ctx: &TenantContext,
        session_id: &str,
    ) -> Result<Option<ConnectionRow>, StoreError> {
        let row = sqlx::query("SELECT * FROM connections WHERE session_id = ?1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .as_ref()
            .map(row_to_connection)
            .filter(|c| !self.strict || ctx.covers(&c.organization_id)))
    }

    async fn delete_connection(
        &self,
        ctx: &TenantContext,
        session_id: &str,
    ) -> Result<(), StoreError> {
        if let Some(existing) = self.find_connection(ctx, session_id).await? {
            self.guard(ctx, "connection", &existing.organization_id, session_id)?;
            sqlx::query("DELETE FROM connections WHERE session_id = ?1")
                .bind(session_id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn list_connections_by_org(
        &self,
        ctx: &TenantContext,
        organization_id: &str,
    ) -> Result<Vec<ConnectionRow>, StoreError> {
        self.guard(ctx, "connection", organization_id, "*")?;
        let rows = sqlx::query("SELECT * FROM connections WHERE organization_id = ?1")
            .bind(organization_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_connection).collect())
    }

    async fn list_connections_by_status(
        &self,
        ctx: &TenantContext,
        statuses: &[ConnectionStatus],
    ) -> Result<Vec<ConnectionRow>, StoreError> {
        let placeholders: Vec<String> =
            (1..=statuses.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "SELECT * FROM connections WHERE status IN ({})",
            placeholders.join(", ")
        );
        let mut query = sqlx::query(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(row_to_connection)
            .filter(|c| ctx.covers(&c.organization_id))
            .collect())
    }

    async fn insert_event(&self, ctx: &TenantContext, row: &EventRow) -> Result<(), StoreError> {
        self.guard(ctx, "event", &row.organization_id, &row.id)?;
        sqlx::query(
            "INSERT INTO events \
             (id, event_type, channel, payload, organization_id, user_id, session_id, \
              acknowledgment, retry_count, created_at, metadata) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )
        .bind(&row.id)
        .bind(&row.event_type)
        .bind(&row.channel)
        .bind(json_text(&row.payload))
        .bind(&row.organization_id)
        .bind(&row.user_id)
        .bind(&row.session_id)
        .bind(row.acknowledgment as i64)
        .bind(row.retry_count as i64)
        .bind(millis(&row.created_at))
        .bind(json_text(&row.metadata))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_audit(&self, ctx: &TenantContext, row: &AuditRow) -> Result<(), StoreError> {
        self.guard(ctx, "audit", &row.organization_id, &row.id)?;
        sqlx::query(
            "INSERT INTO audit_log (id, organization_id, user_id, action, resource, outcome, detail, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(&row.id)
        .bind(&row.organization_id)
        .bind(&row.user_id)
        .bind(&row.action)
        .bind(&row.resource)
        .bind(&row.outcome)
        .bind(json_text(&row.detail))
        .bind(millis(&row.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::types::RoleLevel;
    use chrono::Utc;

    async fn test_store() -> (SqliteMetaStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteMetaStore::connect(&dir.path().join("apix.db"), true)
            .await
            .unwrap();
        (store, dir)
    }

    fn role(id: &str, org: &str, name: &str) -> RoleRow {
        RoleRow {
            id: id.to_string(),
            organization_id: org.to_string(),
            name: name.to_string(),
            permissions: vec!["channel:read".into(), "channel:write".into()],
            level: RoleLevel::Developer,
            is_system: false,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_role_round_trip_and_conflict() {
        let (store, _dir) = test_store().await;
        let ctx = TenantContext::tenant("org-a");

        store
            .insert_role(&ctx, &role("r1", "org-a", "Ops"))
            .await
            .unwrap();
        let found = store.find_role(&ctx, "r1").await.unwrap().unwrap();
        assert_eq!(found.name, "Ops");
        assert_eq!(found.permissions.len(), 2);
        assert_eq!(found.level, RoleLevel::Developer);

        let err = store
            .insert_role(&ctx, &role("r2", "org-a", "Ops"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // Different org, same name is allowed
        store
            .insert_role(&TenantContext::tenant("org-b"), &role("r3", "org-b", "Ops"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_connection_upsert_updates_hot_fields() {
        let (store, _dir) = test_store().await;
        let ctx = TenantContext::tenant("org-a");
        let mut row = ConnectionRow {
            session_id: "s1".into(),
            organization_id: "org-a".into(),
            user_id: Some("u1".into()),
            client_type: ClientType::WebApp,
            status: ConnectionStatus::Connected,
            connected_at: Utc::now(),
            last_heartbeat: Utc::now(),
            disconnected_at: None,
            reconnect_attempts: 0,
            max_reconnect_attempts: 5,
            next_reconnect_at: None,
            quality: ConnectionQuality::Excellent,
            latency_ms: 12.5,
            missed_heartbeats: 0,
            total_disconnections: 0,
            metadata: serde_json::json!({"agent": "test"}),
        };
        store.upsert_connection(&ctx, &row).await.unwrap();

        row.status = ConnectionStatus::Reconnecting;
        row.reconnect_attempts = 2;
        store.upsert_connection(&ctx, &row).await.unwrap();

        let found = store.find_connection(&ctx, "s1").await.unwrap().unwrap();
        assert_eq!(found.status, ConnectionStatus::Reconnecting);
        assert_eq!(found.reconnect_attempts, 2);
        assert_eq!(found.client_type, ClientType::WebApp);
    }

    #[tokio::test]
    async fn test_isolation_hides_foreign_rows() {
        let (store, _dir) = test_store().await;
        store
            .insert_role(&TenantContext::tenant("org-a"), &role("r1", "org-a", "Ops"))
            .await
            .unwrap();
        let foreign = store
            .find_role(&TenantContext::tenant("org-b"), "r1")
            .await
            .unwrap();
        assert!(foreign.is_none());
    }

    #[tokio::test]
    async fn test_delete_organization_cascades() {
        let (store, _dir) = test_store().await;
        let ctx = TenantContext::tenant("org-a");
        let now = Utc::now();

        store
            .upsert_organization(&OrganizationRow {
                id: "org-a".into(),
                slug: "org-a".into(),
                max_users: 1,
                max_connections: 1,
                max_events: 1,
                max_channels: 1,
                max_storage: 1,
                max_api_calls: 1,
                features: vec![],
                settings: serde_json::json!({}),
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        store
            .insert_role(&ctx, &role("r1", "org-a", "Ops"))
            .await
            .unwrap();

        store.delete_organization("org-a").await.unwrap();
        assert!(store.find_role(&ctx, "r1").await.unwrap().is_none());
        assert!(store.find_organization("org-a").await.unwrap().is_none());
    }
}

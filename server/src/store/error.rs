//! Unified error type for the metadata store

use thiserror::Error;

/// Error type for metadata store operations
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite database error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    /// Row not found
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Unique constraint violated (role name collision, duplicate assignment)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Mutation rejected (system role, cross-tenant reference)
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Query issued without a tenant context in strict-isolation mode
    #[error("Tenant context required for {0}")]
    TenantRequired(&'static str),

    /// Row belongs to a different tenant than the active context
    #[error("Tenant isolation violation on {entity}: {id}")]
    IsolationViolation { entity: &'static str, id: String },

    /// Serialization of a JSON column failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Whether a retry might succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Sqlite(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            ),
            _ => false,
        }
    }
}

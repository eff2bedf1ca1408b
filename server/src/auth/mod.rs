//! Authentication and authorization
//!
//! Token issuance lives outside this system; the gateway only needs an
//! [`Authenticator`] that maps a bearer token to a [`Principal`]. Two token
//! shapes are accepted:
//! - HS256 JWTs carrying `{sub, org, roles, permissions, exp}`
//! - Static API keys, configured as SHA-256 digests and compared in
//!   constant time
//!
//! Resolution results sit behind a short-lived cache so the hot handshake
//! path does not re-validate every token.

pub mod audit;
pub mod quota;
pub mod rbac;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::core::config::AuthConfig;
use crate::store::StoreError;

/// TTL for cached principal resolutions
const PRINCIPAL_CACHE_TTL: Duration = Duration::from_secs(60);

/// Capacity of the principal cache
const PRINCIPAL_CACHE_CAPACITY: u64 = 10_000;

// =============================================================================
// Errors
// =============================================================================

/// Error type for authentication and authorization
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AuthError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }
}

// =============================================================================
// Principal
// =============================================================================

/// Resolved identity of an authenticated caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    pub organization_id: String,
    pub user_id: Option<String>,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
}

impl Principal {
    /// Check a `resource:action` permission against the principal's direct
    /// grants (role-derived grants are evaluated by the policy engine)
    pub fn has_permission(&self, required: &str) -> bool {
        rbac::any_permission_matches(&self.permissions, required)
    }
}

// =============================================================================
// Authenticator
// =============================================================================

/// Maps a bearer token to a principal
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn resolve(&self, token: &str) -> Result<Principal, AuthError>;
}

/// JWT claims accepted by the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// User id; absent for machine tokens
    #[serde(default)]
    pub sub: Option<String>,
    /// Organization the token is scoped to
    pub org: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    pub exp: i64,
}

/// Default authenticator: JWT validation plus static API keys
pub struct TokenAuthenticator {
    decoding_key: Option<DecodingKey>,
    /// Hex SHA-256 digest -> principal
    api_keys: HashMap<String, Principal>,
    cache: moka::future::Cache<String, Principal>,
}

impl TokenAuthenticator {
    pub fn from_config(config: &AuthConfig) -> Self {
        let decoding_key = config
            .jwt_secret
            .as_ref()
            .map(|secret| DecodingKey::from_secret(secret.as_bytes()));

        let api_keys = config
            .api_keys
            .iter()
            .map(|entry| {
                (
                    entry.token_sha256.to_lowercase(),
                    Principal {
                        organization_id: entry.organization_id.clone(),
                        user_id: entry.user_id.clone(),
                        roles: entry.roles.clone(),
                        permissions: entry.permissions.clone(),
                    },
                )
            })
            .collect();

        Self {
            decoding_key,
            api_keys,
            cache: moka::future::Cache::builder()
                .max_capacity(PRINCIPAL_CACHE_CAPACITY)
                .time_to_live(PRINCIPAL_CACHE_TTL)
                .build(),
        }
    }

    fn resolve_jwt(&self, token: &str) -> Option<Result<Principal, AuthError>> {
        let key = self.decoding_key.as_ref()?;
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.set_required_spec_claims(&["exp"]);

        Some(match decode::<TokenClaims>(token, key, &validation) {
            Ok(data) => Ok(Principal {
                organization_id: data.claims.org,
                user_id: data.claims.sub,
                roles: data.claims.roles,
                permissions: data.claims.permissions,
            }),
            Err(e) => match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    Err(AuthError::Unauthorized("token expired".into()))
                }
                _ => Err(AuthError::Unauthorized("invalid token".into())),
            },
        })
    }

    fn resolve_api_key(&self, token: &str) -> Option<Principal> {
        let digest = hex::encode(Sha256::digest(token.as_bytes()));
        // Constant-time scan over all configured digests
        let mut found: Option<&Principal> = None;
        for (stored, principal) in &self.api_keys {
            if stored.as_bytes().ct_eq(digest.as_bytes()).into() {
                found = Some(principal);
            }
        }
        found.cloned()
    }
}

#[async_trait]
impl Authenticator for TokenAuthenticator {
    async fn resolve(&self, token: &str) -> Result<Principal, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Unauthorized("missing token".into()));
        }
        if let Some(principal) = self.cache.get(token).await {
            return Ok(principal);
        }

        // JWTs have two dots; everything else is treated as an API key
        let principal = if token.matches('.').count() == 2 {
            match self.resolve_jwt(token) {
                Some(result) => result?,
                None => return Err(AuthError::Unauthorized("JWT auth not configured".into())),
            }
        } else {
            self.resolve_api_key(token)
                .ok_or_else(|| AuthError::Unauthorized("unknown API key".into()))?
        };

        self.cache.insert(token.to_string(), principal.clone()).await;
        Ok(principal)
    }
}

/// Development authenticator used with `--no-auth`: every caller becomes a
/// full-access member of the `local` organization
pub struct AllowAllAuthenticator;

#[async_trait]
impl Authenticator for AllowAllAuthenticator {
    async fn resolve(&self, _token: &str) -> Result<Principal, AuthError> {
        Ok(Principal {
            organization_id: "local".into(),
            user_id: Some("local".into()),
            roles: vec!["ORG_ADMIN".into()],
            permissions: vec!["*:*".into()],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::ApiKeyEntry;
    use jsonwebtoken::{EncodingKey, Header, encode};

    fn signed_token(secret: &str, claims: &TokenClaims) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn jwt_config(secret: &str) -> AuthConfig {
        AuthConfig {
            enabled: true,
            jwt_secret: Some(secret.to_string()),
            api_keys: Vec::new(),
        }
    }

    fn claims(org: &str, exp_offset_secs: i64) -> TokenClaims {
        TokenClaims {
            sub: Some("u1".into()),
            org: org.into(),
            roles: vec!["Ops".into()],
            permissions: vec!["channel:read".into()],
            exp: chrono::Utc::now().timestamp() + exp_offset_secs,
        }
    }

    #[tokio::test]
    async fn test_valid_jwt_resolves_principal() {
        let auth = TokenAuthenticator::from_config(&jwt_config("secret"));
        let token = signed_token("secret", &claims("org-a", 3600));

        let principal = auth.resolve(&token).await.unwrap();
        assert_eq!(principal.organization_id, "org-a");
        assert_eq!(principal.user_id.as_deref(), Some("u1"));
        assert!(principal.has_permission("channel:read"));
        assert!(!principal.has_permission("channel:write"));
    }

    #[tokio::test]
    async fn test_expired_jwt_rejected() {
        let auth = TokenAuthenticator::from_config(&jwt_config("secret"));
        let token = signed_token("secret", &claims("org-a", -3600));
        let err = auth.resolve(&token).await.unwrap_err();
        assert!(matches!(err, AuthError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_wrong_signature_rejected() {
        let auth = TokenAuthenticator::from_config(&jwt_config("secret"));
        let token = signed_token("other-secret", &claims("org-a", 3600));
        assert!(auth.resolve(&token).await.is_err());
    }

    #[tokio::test]
    async fn test_api_key_resolution() {
        let digest = hex::encode(Sha256::digest(b"pk-apix-test-token"));
        let config = AuthConfig {
            enabled: true,
            jwt_secret: None,
            api_keys: vec![ApiKeyEntry {
                token_sha256: digest,
                organization_id: "org-b".into(),
                user_id: None,
                roles: vec![],
                permissions: vec!["system:write".into()],
            }],
        };
        let auth = TokenAuthenticator::from_config(&config);

        let principal = auth.resolve("pk-apix-test-token").await.unwrap();
        assert_eq!(principal.organization_id, "org-b");
        assert!(principal.has_permission("system:write"));

        assert!(auth.resolve("pk-apix-wrong").await.is_err());
    }

    #[tokio::test]
    async fn test_cache_serves_repeat_lookups() {
        let auth = TokenAuthenticator::from_config(&jwt_config("secret"));
        let token = signed_token("secret", &claims("org-a", 3600));
        let first = auth.resolve(&token).await.unwrap();
        let second = auth.resolve(&token).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_allow_all_for_dev_mode() {
        let auth = AllowAllAuthenticator;
        let principal = auth.resolve("anything").await.unwrap();
        assert_eq!(principal.organization_id, "local");
        assert!(principal.has_permission("channel:write"));
    }
}

//! Application configuration
//!
//! Configuration is layered, later layers taking precedence:
//! 1. Built-in defaults
//! 2. Profile config file (`~/.apix/apix.json`)
//! 3. Local config file (`./apix.json` or `--config <path>`)
//! 4. Environment variables / CLI flags

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::cli::CliConfig;
use super::constants::{
    APP_DOT_FOLDER, CONFIG_FILE_NAME, DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_CHANNEL_TTL_MS,
    DEFAULT_CONSUMER_GROUP, DEFAULT_HEALTH_HISTORY_MS, DEFAULT_HEALTH_INTERVAL_MS,
    DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_HEARTBEAT_MAX_MISSED, DEFAULT_HEARTBEAT_TIMEOUT_MS,
    DEFAULT_HOST, DEFAULT_INITIAL_DELAY_MS, DEFAULT_JITTER_FACTOR, DEFAULT_MAX_DELAY_MS,
    DEFAULT_MAX_OUTBOUND, DEFAULT_MAX_SUBSCRIPTIONS, DEFAULT_PORT, DEFAULT_QUEUE_BACKOFF_MS,
    DEFAULT_QUEUE_BATCH_SIZE, DEFAULT_QUEUE_BLOCK_MS, DEFAULT_QUEUE_CONCURRENCY,
    DEFAULT_QUEUE_MAX_ATTEMPTS, DEFAULT_RATE_LIMIT_MAX, DEFAULT_RATE_LIMIT_WINDOW_MS,
    DEFAULT_RECONNECT_MAX_ATTEMPTS, DEFAULT_RESET_AFTER_MS, DEFAULT_WS_IDLE_TIMEOUT_SECS,
    DEFAULT_WS_MAX_CONNECTIONS, DEFAULT_WS_MAX_PAYLOAD, DEFAULT_WS_PATH,
};

// =============================================================================
// Backend Enums
// =============================================================================

/// Stream broker backend type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackendType {
    #[default]
    Memory,
    Redis,
}

impl fmt::Display for BrokerBackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerBackendType::Memory => write!(f, "memory"),
            BrokerBackendType::Redis => write!(f, "redis"),
        }
    }
}

/// Metadata store backend type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackendType {
    #[default]
    Memory,
    Sqlite,
}

impl fmt::Display for StoreBackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreBackendType::Memory => write!(f, "memory"),
            StoreBackendType::Sqlite => write!(f, "sqlite"),
        }
    }
}

/// Reconnection delay strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectStrategy {
    #[default]
    Exponential,
    Linear,
    Fixed,
    Adaptive,
}

/// Backoff mode for queue message retries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffMode {
    Fixed,
    #[default]
    Exponential,
}

// =============================================================================
// Sections
// =============================================================================

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub max_missed: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            timeout_ms: DEFAULT_HEARTBEAT_TIMEOUT_MS,
            max_missed: DEFAULT_HEARTBEAT_MAX_MISSED,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_ms: u64,
    pub max: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: DEFAULT_RATE_LIMIT_WINDOW_MS,
            max: DEFAULT_RATE_LIMIT_MAX,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub max_subscriptions: usize,
    pub default_ttl_ms: u64,
    /// Per-session outbound queue depth; events beyond it are dropped
    pub max_outbound: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_subscriptions: DEFAULT_MAX_SUBSCRIPTIONS,
            default_ttl_ms: DEFAULT_CHANNEL_TTL_MS,
            max_outbound: DEFAULT_MAX_OUTBOUND,
        }
    }
}

/// Reconnection policy for dropped sessions
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub strategy: ReconnectStrategy,
    pub backoff_multiplier: f64,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
    pub jitter_factor: f64,
    pub reset_after_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RECONNECT_MAX_ATTEMPTS,
            strategy: ReconnectStrategy::default(),
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            initial_delay_ms: DEFAULT_INITIAL_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter: true,
            jitter_factor: DEFAULT_JITTER_FACTOR,
            reset_after_ms: DEFAULT_RESET_AFTER_MS,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WsConfig {
    pub path: String,
    pub max_payload_length: usize,
    pub idle_timeout_secs: u64,
    pub max_connections: usize,
    pub heartbeat: HeartbeatConfig,
    pub rate_limit: RateLimitConfig,
    pub channels: ChannelConfig,
    pub retry: RetryConfig,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_WS_PATH.to_string(),
            max_payload_length: DEFAULT_WS_MAX_PAYLOAD,
            idle_timeout_secs: DEFAULT_WS_IDLE_TIMEOUT_SECS,
            max_connections: DEFAULT_WS_MAX_CONNECTIONS,
            heartbeat: HeartbeatConfig::default(),
            rate_limit: RateLimitConfig::default(),
            channels: ChannelConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueSettings {
    pub consumer_group: String,
    /// Per-process unique consumer name; generated when absent
    pub consumer_name: Option<String>,
    pub backoff_mode: BackoffMode,
    pub backoff_delay_ms: u64,
    pub max_backoff_ms: u64,
    pub max_attempts: u32,
    pub batch_size: usize,
    pub block_ms: u64,
    pub concurrency: usize,
    /// Acknowledge entries as soon as the handler returns success
    pub auto_ack: bool,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            consumer_name: None,
            backoff_mode: BackoffMode::default(),
            backoff_delay_ms: DEFAULT_QUEUE_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_DELAY_MS,
            max_attempts: DEFAULT_QUEUE_MAX_ATTEMPTS,
            batch_size: DEFAULT_QUEUE_BATCH_SIZE,
            block_ms: DEFAULT_QUEUE_BLOCK_MS,
            concurrency: DEFAULT_QUEUE_CONCURRENCY,
            auto_ack: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthThresholds {
    pub max_average_latency_ms: f64,
    pub max_error_rate: f64,
    pub min_healthy_ratio: f64,
    pub max_system_load: f64,
    pub max_reconnection_rate: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            max_average_latency_ms: 1_000.0,
            max_error_rate: 0.1,
            min_healthy_ratio: 0.8,
            max_system_load: 0.8,
            max_reconnection_rate: 0.2,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthConfig {
    pub thresholds: HealthThresholds,
    pub interval_ms: u64,
    pub history_retention_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            thresholds: HealthThresholds::default(),
            interval_ms: DEFAULT_HEALTH_INTERVAL_MS,
            history_retention_ms: DEFAULT_HEALTH_HISTORY_MS,
        }
    }
}

/// Per-tenant resource ceilings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TenantLimits {
    pub max_users: u64,
    pub max_connections: u64,
    pub max_events: u64,
    pub max_channels: u64,
    pub max_storage: u64,
    pub max_api_calls: u64,
    pub features: Vec<String>,
}

impl Default for TenantLimits {
    fn default() -> Self {
        Self {
            max_users: 100,
            max_connections: 1_000,
            max_events: 100_000,
            max_channels: 100,
            max_storage: 1024 * 1024 * 1024,
            max_api_calls: 600_000,
            features: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TenantConfig {
    pub strict_isolation: bool,
    pub resource_limits: bool,
    pub audit_logging: bool,
    pub limits: TenantLimits,
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            strict_isolation: true,
            resource_limits: true,
            audit_logging: true,
            limits: TenantLimits::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub backend: BrokerBackendType,
    pub redis_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackendType,
    pub path: Option<PathBuf>,
}

/// Static API key entry: SHA-256 digest of the token plus the principal it maps to
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiKeyEntry {
    pub token_sha256: String,
    pub organization_id: String,
    pub user_id: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,
    /// HS256 signing secret; required when auth is enabled
    pub jwt_secret: Option<String>,
    pub api_keys: Vec<ApiKeyEntry>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            jwt_secret: None,
            api_keys: Vec::new(),
        }
    }
}

// =============================================================================
// AppConfig
// =============================================================================

/// Fully resolved application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub ws: WsConfig,
    pub queue: QueueSettings,
    pub health: HealthConfig,
    pub tenant: TenantConfig,
    pub broker: BrokerConfig,
    pub store: StoreConfig,
    pub auth: AuthConfig,
}

/// Partial config as read from a JSON file; sections present replace earlier layers
#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
    server: Option<ServerConfig>,
    ws: Option<WsConfig>,
    queue: Option<QueueSettings>,
    health: Option<HealthConfig>,
    tenant: Option<TenantConfig>,
    broker: Option<BrokerConfig>,
    store: Option<StoreConfig>,
    auth: Option<AuthConfig>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

impl FileConfig {
    fn load_from_file(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "Loading config file");
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Warn about unknown top-level fields (possible typos)
    fn warn_unknown_fields(&self) {
        if !self.extra.is_empty() {
            let keys: Vec<&str> = self.extra.keys().map(|k| k.as_str()).collect();
            tracing::warn!(fields = %keys.join(", "), "Unknown fields in config file");
        }
    }

    fn apply(self, config: &mut AppConfig) {
        if let Some(server) = self.server {
            config.server = server;
        }
        if let Some(ws) = self.ws {
            config.ws = ws;
        }
        if let Some(queue) = self.queue {
            config.queue = queue;
        }
        if let Some(health) = self.health {
            config.health = health;
        }
        if let Some(tenant) = self.tenant {
            config.tenant = tenant;
        }
        if let Some(broker) = self.broker {
            config.broker = broker;
        }
        if let Some(store) = self.store {
            config.store = store;
        }
        if let Some(auth) = self.auth {
            config.auth = auth;
        }
    }
}

impl AppConfig {
    /// Load configuration, merging files, environment and CLI flags
    pub fn load(cli: &CliConfig) -> Result<Self> {
        let mut config = AppConfig::default();

        if let Some(profile_path) = profile_config_path()
            && profile_path.exists()
        {
            let file = FileConfig::load_from_file(&profile_path)?;
            file.warn_unknown_fields();
            file.apply(&mut config);
        }

        let local_path = cli
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
        if local_path.exists() {
            let file = FileConfig::load_from_file(&local_path)?;
            file.warn_unknown_fields();
            file.apply(&mut config);
        } else if cli.config.is_some() {
            anyhow::bail!("Config file not found: {}", local_path.display());
        }

        config.apply_cli(cli);
        config.validate()?;
        Ok(config)
    }

    fn apply_cli(&mut self, cli: &CliConfig) {
        if let Some(host) = &cli.host {
            self.server.host = host.clone();
        }
        if let Some(port) = cli.port {
            self.server.port = port;
        }
        if cli.no_auth {
            self.auth.enabled = false;
        }
        if let Some(backend) = cli.broker_backend {
            self.broker.backend = backend;
        }
        if let Some(url) = &cli.broker_redis_url {
            self.broker.redis_url = Some(url.clone());
        }
        if let Some(backend) = cli.store_backend {
            self.store.backend = backend;
        }
        if let Some(path) = &cli.store_path {
            self.store.path = Some(path.clone());
        }
        if let Some(secret) = &cli.jwt_secret {
            self.auth.jwt_secret = Some(secret.clone());
        }
    }

    fn validate(&self) -> Result<()> {
        if self.broker.backend == BrokerBackendType::Redis && self.broker.redis_url.is_none() {
            anyhow::bail!("broker.redis_url is required for the redis broker backend");
        }
        if self.store.backend == StoreBackendType::Sqlite && self.store.path.is_none() {
            anyhow::bail!("store.path is required for the sqlite store backend");
        }
        if self.auth.enabled && self.auth.jwt_secret.is_none() && self.auth.api_keys.is_empty() {
            anyhow::bail!(
                "auth is enabled but neither auth.jwt_secret nor auth.api_keys is configured \
                 (use --no-auth for local development)"
            );
        }
        if self.ws.heartbeat.interval_ms == 0 {
            anyhow::bail!("ws.heartbeat.interval_ms must be positive");
        }
        Ok(())
    }
}

fn profile_config_path() -> Option<PathBuf> {
    std::env::home_dir().map(|home| home.join(APP_DOT_FOLDER).join(CONFIG_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recognized_option_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.ws.heartbeat.interval_ms, 30_000);
        assert_eq!(config.ws.heartbeat.max_missed, 3);
        assert_eq!(config.ws.rate_limit.max, 100);
        assert_eq!(config.ws.channels.max_subscriptions, 50);
        assert_eq!(config.ws.retry.max_attempts, 5);
        assert_eq!(config.ws.retry.initial_delay_ms, 1_000);
        assert_eq!(config.ws.retry.max_delay_ms, 30_000);
        assert!(config.ws.retry.jitter);
        assert_eq!(config.queue.consumer_group, "apix-consumers");
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.health.thresholds.max_error_rate, 0.1);
        assert_eq!(config.health.interval_ms, 30_000);
    }

    #[test]
    fn test_partial_file_section_replaces_defaults() {
        let mut config = AppConfig::default();
        let file: FileConfig =
            serde_json::from_str(r#"{ "server": { "port": 9999 } }"#).unwrap();
        file.apply(&mut config);
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.server.host, DEFAULT_HOST);
    }

    #[test]
    fn test_unknown_fields_are_collected() {
        let file: FileConfig =
            serde_json::from_str(r#"{ "sevrer": { "port": 1 } }"#).unwrap();
        assert!(file.extra.contains_key("sevrer"));
    }

    #[test]
    fn test_validate_rejects_redis_without_url() {
        let mut config = AppConfig::default();
        config.auth.enabled = false;
        config.broker.backend = BrokerBackendType::Redis;
        assert!(config.validate().is_err());
        config.broker.redis_url = Some("redis://localhost:6379".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_auth_without_secret() {
        let config = AppConfig::default();
        assert!(config.validate().is_err());
    }
}

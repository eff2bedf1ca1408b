// =============================================================================
// Application Identity
// =============================================================================

/// Application name in title case (for display)
pub const APP_NAME: &str = "Apix";

/// Application name in lowercase (for paths and identifiers)
pub const APP_NAME_LOWER: &str = "apix";

/// Unix-style dotfile folder name
pub const APP_DOT_FOLDER: &str = ".apix";

// =============================================================================
// Configuration Files
// =============================================================================

/// Config file name
pub const CONFIG_FILE_NAME: &str = "apix.json";

/// Environment variable for config file path
pub const ENV_CONFIG: &str = "APIX_CONFIG";

// =============================================================================
// Environment Variables
// =============================================================================

/// Environment variable for server host
pub const ENV_HOST: &str = "APIX_HOST";

/// Environment variable for server port
pub const ENV_PORT: &str = "APIX_PORT";

/// Environment variable for log level/filter
pub const ENV_LOG: &str = "APIX_LOG";

/// Environment variable for broker backend (memory or redis)
pub const ENV_BROKER_BACKEND: &str = "APIX_BROKER_BACKEND";

/// Environment variable for the Redis URL used by the broker
pub const ENV_BROKER_REDIS_URL: &str = "APIX_BROKER_REDIS_URL";

/// Environment variable for store backend (memory or sqlite)
pub const ENV_STORE_BACKEND: &str = "APIX_STORE_BACKEND";

/// Environment variable for the SQLite database path
pub const ENV_STORE_PATH: &str = "APIX_STORE_PATH";

/// Environment variable for the JWT signing secret
pub const ENV_JWT_SECRET: &str = "APIX_JWT_SECRET";

// =============================================================================
// Server Defaults
// =============================================================================

/// Default server host
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default server port
pub const DEFAULT_PORT: u16 = 5680;

/// Default WebSocket upgrade path
pub const DEFAULT_WS_PATH: &str = "/ws";

/// Default maximum WebSocket payload length in bytes (16 MiB)
pub const DEFAULT_WS_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Default idle timeout for sockets in seconds
pub const DEFAULT_WS_IDLE_TIMEOUT_SECS: u64 = 120;

/// Default maximum concurrent connections per node
pub const DEFAULT_WS_MAX_CONNECTIONS: usize = 10_000;

// =============================================================================
// Heartbeat Defaults
// =============================================================================

/// Default heartbeat interval in milliseconds
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;

/// Default heartbeat timeout in milliseconds
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 60_000;

/// Default maximum missed heartbeats before a session is considered dead
pub const DEFAULT_HEARTBEAT_MAX_MISSED: u32 = 3;

/// Adaptive heartbeat changes are only applied beyond this delta
pub const HEARTBEAT_ADAPTIVE_DEADBAND_MS: u64 = 5_000;

/// Durable connection row written on every K-th heartbeat
pub const HEARTBEAT_PERSIST_EVERY: u32 = 10;

// =============================================================================
// Rate Limit Defaults
// =============================================================================

/// Default inbound frame rate-limit window in milliseconds
pub const DEFAULT_RATE_LIMIT_WINDOW_MS: u64 = 60_000;

/// Default maximum inbound frames per window per session
pub const DEFAULT_RATE_LIMIT_MAX: u32 = 100;

// =============================================================================
// Channel Defaults
// =============================================================================

/// Default maximum subscriptions per session
pub const DEFAULT_MAX_SUBSCRIPTIONS: usize = 50;

/// Default TTL before a subscriber-free channel is retired (1 hour)
pub const DEFAULT_CHANNEL_TTL_MS: u64 = 3_600_000;

/// Default per-session outbound queue depth
pub const DEFAULT_MAX_OUTBOUND: usize = 256;

// =============================================================================
// Retry / Reconnection Defaults
// =============================================================================

/// Default maximum delivery attempts for queue messages
pub const DEFAULT_QUEUE_MAX_ATTEMPTS: u32 = 3;

/// Default maximum reconnection attempts for a session
pub const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 5;

/// Default backoff multiplier
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Default initial backoff delay in milliseconds
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 1_000;

/// Default maximum backoff delay in milliseconds
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

/// Default jitter factor applied to reconnection delays
pub const DEFAULT_JITTER_FACTOR: f64 = 0.5;

/// Reconnect attempt counter resets after this much stable uptime
pub const DEFAULT_RESET_AFTER_MS: u64 = 300_000;

/// Floor applied to jittered delays
pub const MIN_RECONNECT_DELAY_MS: u64 = 100;

// =============================================================================
// Queue Defaults
// =============================================================================

/// Consumer group shared by all queue workers
pub const DEFAULT_CONSUMER_GROUP: &str = "apix-consumers";

/// Default backoff delay between failed deliveries in milliseconds
pub const DEFAULT_QUEUE_BACKOFF_MS: u64 = 1_000;

/// Default batch size for blocking stream reads
pub const DEFAULT_QUEUE_BATCH_SIZE: usize = 16;

/// Default block timeout for stream reads in milliseconds
pub const DEFAULT_QUEUE_BLOCK_MS: u64 = 5_000;

/// Default worker count per queue
pub const DEFAULT_QUEUE_CONCURRENCY: usize = 1;

/// Maximum DLQ entries drained per reprocess call
pub const DLQ_REPROCESS_BATCH: usize = 100;

// =============================================================================
// Health Defaults
// =============================================================================

/// Default health sampling interval in milliseconds
pub const DEFAULT_HEALTH_INTERVAL_MS: u64 = 30_000;

/// Default health history retention in milliseconds (1 hour)
pub const DEFAULT_HEALTH_HISTORY_MS: u64 = 3_600_000;

/// Acknowledged alerts are kept this long before pruning (1 hour)
pub const ALERT_GRACE_MS: u64 = 3_600_000;

// =============================================================================
// Background Tasks
// =============================================================================

/// Stale connection sweep interval in seconds (5 minutes)
pub const CLEANUP_SWEEP_INTERVAL_SECS: u64 = 300;

/// Delayed/retry queue sweep tick in milliseconds
pub const QUEUE_SWEEP_TICK_MS: u64 = 250;

/// Graceful shutdown timeout in seconds
pub const SHUTDOWN_TIMEOUT_SECS: u64 = 5;

// =============================================================================
// Gateway
// =============================================================================

/// Deadline for the client auth frame after socket accept, in seconds
pub const HANDSHAKE_DEADLINE_SECS: u64 = 10;

/// Consecutive parse failures tolerated before the socket is closed
pub const PARSE_ERROR_THRESHOLD: u32 = 5;

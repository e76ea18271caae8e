use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Gateway configuration, loaded from the environment.
///
/// Every knob has a production-sensible default so a bare `table-gateway`
/// binary comes up without a `.env`. Durations are configured in
/// milliseconds (`*_MS`) or seconds (`*_SECS`) as named.
#[derive(Clone, Debug)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    pub jwt_secret: String,
    pub is_production: bool,

    // ── Delivery pipeline ────────────────────────────────────────────────
    /// Flush delay for a non-full batch when adaptive tuning is off (and the
    /// starting window when it is on).
    pub batch_window: Duration,
    /// Queue depth that forces an immediate flush.
    pub max_batch_size: usize,
    pub enable_adaptive_batching: bool,
    pub enable_deduplication: bool,
    pub compression_level: u32,
    /// Serialized batches at or below this many bytes stay uncompressed.
    pub compression_threshold: usize,
    pub enable_batch_compression: bool,

    // ── Pool / admission ─────────────────────────────────────────────────
    pub max_connections_per_table: usize,
    pub max_total_connections: usize,
    /// Missed-pong threshold before a connection is considered stale.
    pub connection_timeout: Duration,
    /// Reconnect window after an unexpected socket close.
    pub grace_period: Duration,
    /// Inactivity threshold before an open connection is evicted.
    pub idle_timeout: Duration,

    // ── Lifecycle ────────────────────────────────────────────────────────
    pub heartbeat_interval: Duration,
    /// Background trim cadence for history rings and stale rate buckets.
    pub cleanup_interval: Duration,
    /// Client-facing reconnect hints carried in the welcome frame.
    pub max_reconnect_attempts: u32,
    pub reconnect_backoff: Duration,

    // ── Subscriptions ────────────────────────────────────────────────────
    /// Total subscriptions allowed per connection, across all channels.
    pub max_channels_per_connection: usize,

    // ── Collaborators ────────────────────────────────────────────────────
    /// Base URL of the HTTP chat moderator. When unset, the in-process
    /// permissive moderator is used (dev / test).
    pub chat_moderator_url: Option<String>,
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_parse(key, default_ms))
}

fn env_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_parse(key, default_secs))
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Config {
            server_host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            server_port: env_parse("SERVER_PORT", 8080),
            jwt_secret: env::var("JWT_SECRET")
                .unwrap_or_else(|_| "dev_secret_change_in_production".to_string()),
            is_production: env::var("APP_ENV").as_deref() == Ok("production"),

            batch_window: env_millis("BATCH_WINDOW_MS", 100),
            max_batch_size: env_parse("MAX_BATCH_SIZE", 10),
            enable_adaptive_batching: env_parse("ENABLE_ADAPTIVE_BATCHING", true),
            enable_deduplication: env_parse("ENABLE_DEDUPLICATION", true),
            compression_level: env_parse("COMPRESSION_LEVEL", 6),
            compression_threshold: env_parse("COMPRESSION_THRESHOLD", 1024),
            enable_batch_compression: env_parse("ENABLE_BATCH_COMPRESSION", true),

            max_connections_per_table: env_parse("MAX_CONNECTIONS_PER_TABLE", 100),
            max_total_connections: env_parse("MAX_TOTAL_CONNECTIONS", 5000),
            connection_timeout: env_secs("CONNECTION_TIMEOUT_SECS", 60),
            grace_period: env_secs("GRACE_PERIOD_SECS", 30),
            idle_timeout: env_secs("IDLE_TIMEOUT_SECS", 300),

            heartbeat_interval: env_secs("HEARTBEAT_INTERVAL_SECS", 30),
            cleanup_interval: env_secs("CLEANUP_INTERVAL_SECS", 300),
            max_reconnect_attempts: env_parse("MAX_RECONNECT_ATTEMPTS", 5),
            reconnect_backoff: env_millis("RECONNECT_BACKOFF_MS", 1000),

            max_channels_per_connection: env_parse("MAX_CHANNELS_PER_CONNECTION", 10),

            chat_moderator_url: env::var("CHAT_MODERATOR_URL").ok(),
        }
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

impl Default for Config {
    /// Defaults without touching the environment — the test configuration.
    fn default() -> Self {
        Config {
            server_host: "127.0.0.1".to_string(),
            server_port: 8080,
            jwt_secret: "dev_secret_change_in_production".to_string(),
            is_production: false,

            batch_window: Duration::from_millis(100),
            max_batch_size: 10,
            enable_adaptive_batching: true,
            enable_deduplication: true,
            compression_level: 6,
            compression_threshold: 1024,
            enable_batch_compression: true,

            max_connections_per_table: 100,
            max_total_connections: 5000,
            connection_timeout: Duration::from_secs(60),
            grace_period: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),

            heartbeat_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(300),
            max_reconnect_attempts: 5,
            reconnect_backoff: Duration::from_millis(1000),

            max_channels_per_connection: 10,

            chat_moderator_url: None,
        }
    }
}

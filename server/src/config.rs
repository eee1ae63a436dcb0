//! Process-wide configuration, loaded once from the environment at startup.
//!
//! Mirrors the env-var-driven style used throughout this codebase (see
//! `db::DbConfig::default`, `auth::AuthMiddleware::new`) rather than reaching
//! for a config-file crate: every setting has a documented default and is
//! read with `std::env::var(...).unwrap_or_else(...)`.

use std::time::Duration;

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// What an `OutboundQueue` does once a connection's backlog hits capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropPolicy {
    DropOld,
    DropNew,
}

impl std::str::FromStr for DropPolicy {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "drop_old" => Ok(DropPolicy::DropOld),
            "drop_new" => Ok(DropPolicy::DropNew),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WsConfig {
    pub heartbeat_interval: Duration,
    pub resume_ttl: Duration,
    pub max_buffered_bytes: usize,
    pub message_max_bytes: usize,
    pub max_queue: usize,
    pub drop_policy: DropPolicy,
    /// Fraction of partition-matched connections that must be overloaded
    /// before the consumer treats the broadcast itself as rejected.
    pub backpressure_fraction: f64,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub connections_per_min: u32,
    pub messages_per_min: u32,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub enabled: bool,
    pub stream_key: String,
    pub group: String,
    pub consumer_name: String,
    pub redis_url: String,
    pub batch_size: usize,
    pub block_ms: usize,
    pub claim_idle_ms: i64,
    pub reorder_timeout_ms: u64,
    pub max_attempts: i32,
    pub tick_ms: u64,
}

#[derive(Debug, Clone)]
pub struct DbTuning {
    pub url: String,
    pub pool_max: u32,
    pub pool_min: u32,
    pub acquire_timeout: Duration,
    pub statement_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_public_key_pem: Option<String>,
    pub jwt_secret: Option<String>,
    pub jwt_algorithms: Vec<String>,
    pub jwks_url: Option<String>,
    pub clock_skew: Duration,
    pub jti_ttl: Duration,
    pub issuer: Option<String>,
    pub audience: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RatchetConfig {
    pub max_skipped: usize,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub ws: WsConfig,
    pub ratelimit: RateLimitConfig,
    pub queue: QueueConfig,
    pub db: DbTuning,
    pub auth: AuthConfig,
    pub ratchet: RatchetConfig,
    pub enable_metrics: bool,
}

impl Config {
    /// Load configuration from the process environment. `.env` (if present)
    /// has already been merged into the environment by the caller.
    pub fn from_env() -> Self {
        Config {
            server: ServerConfig {
                host: env_string("SERVER_HOST", "0.0.0.0"),
                port: env_parse("SERVER_PORT", 8080),
            },
            ws: WsConfig {
                heartbeat_interval: Duration::from_millis(env_parse("WS_HEARTBEAT_INTERVAL_MS", 60_000)),
                resume_ttl: Duration::from_millis(env_parse("WS_RESUME_TTL_MS", 900_000)),
                max_buffered_bytes: env_parse("WS_MAX_BUFFERED_BYTES", 5 * 1024 * 1024),
                message_max_bytes: env_parse("WS_MESSAGE_MAX_BYTES", 65_536),
                max_queue: env_parse("WS_MAX_QUEUE", 256),
                drop_policy: env_parse("WS_DROP_POLICY", DropPolicy::DropOld),
                backpressure_fraction: env_parse("WS_BACKPRESSURE_FRACTION", 0.5),
            },
            ratelimit: RateLimitConfig {
                connections_per_min: env_parse("RATELIMIT_CONNECTIONS_PER_MIN", 30),
                messages_per_min: env_parse("RATELIMIT_MESSAGES_PER_MIN", 600),
            },
            queue: QueueConfig {
                enabled: env_parse("QUEUE_ENABLED", true),
                stream_key: env_string("QUEUE_STREAM_KEY", "realtime:messages"),
                group: env_string("QUEUE_GROUP", "hub-consumers"),
                consumer_name: env_string(
                    "QUEUE_CONSUMER_NAME",
                    &format!("consumer-{}", uuid::Uuid::new_v4()),
                ),
                redis_url: env_string("QUEUE_REDIS_URL", "redis://127.0.0.1:6379"),
                batch_size: env_parse("QUEUE_BATCH_SIZE", 100),
                block_ms: env_parse("QUEUE_BLOCK_MS", 2_000),
                claim_idle_ms: env_parse("QUEUE_CLAIM_IDLE_MS", 30_000),
                reorder_timeout_ms: env_parse("QUEUE_REORDER_TIMEOUT_MS", 2_000),
                max_attempts: env_parse("QUEUE_MAX_ATTEMPTS", 5),
                tick_ms: env_parse("QUEUE_TICK_MS", 100),
            },
            db: DbTuning {
                url: env_string("DATABASE_URL", "postgres://localhost/realtime_core"),
                pool_max: env_parse("DB_POOL_MAX", 10),
                pool_min: env_parse("DB_POOL_MIN", 2),
                acquire_timeout: Duration::from_millis(env_parse("DB_ACQUIRE_TIMEOUT_MS", 2_000)),
                statement_timeout: Duration::from_millis(env_parse("DB_STATEMENT_TIMEOUT_MS", 3_000)),
            },
            auth: AuthConfig {
                jwt_public_key_pem: std::env::var("AUTH_JWT_PUBLIC_KEY_PEM").ok(),
                jwt_secret: std::env::var("AUTH_JWT_SECRET").ok(),
                jwt_algorithms: env_string("AUTH_JWT_ALGORITHMS", "ES256")
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .collect(),
                jwks_url: std::env::var("AUTH_JWKS_URL").ok(),
                clock_skew: Duration::from_secs(env_parse("AUTH_CLOCK_SKEW_SEC", 30)),
                jti_ttl: Duration::from_secs(env_parse("AUTH_JTI_TTL_SEC", 300)),
                issuer: std::env::var("AUTH_ISSUER").ok(),
                audience: std::env::var("AUTH_AUDIENCE").ok(),
            },
            ratchet: RatchetConfig {
                max_skipped: env_parse("RATCHET_MAX_SKIPPED", 2000),
            },
            enable_metrics: env_parse("ENABLE_METRICS", false),
        }
    }
}

use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use std::time::Duration;

// ============================================================================
// Configuration Types
// ============================================================================

/// Sizing and timing of the broker connection pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPoolConfig {
    /// Broker addresses (host:port), tried in order when connecting
    pub brokers: Vec<String>,
    /// Maximum live connections (idle + checked out)
    pub max_size: usize,
    /// Maximum idle connections kept for reuse
    pub max_idle: usize,
    /// Idle connections older than this are closed
    pub idle_timeout_ms: u64,
    /// Connections older than this are closed regardless of use
    pub max_lifetime_ms: u64,
    /// How long `get()` waits for capacity before giving up
    pub acquire_timeout_ms: u64,
    /// Per-attempt connect timeout
    pub connect_timeout_ms: u64,
}

impl BrokerPoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_millis(self.max_lifetime_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for BrokerPoolConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["127.0.0.1:9092".to_string()],
            max_size: 50,
            max_idle: 50,
            idle_timeout_ms: 10_000,
            max_lifetime_ms: 60_000,
            acquire_timeout_ms: 1_000,
            connect_timeout_ms: 1_000,
        }
    }
}

/// Leaky-bucket admission settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Tokens per window; 0 disables throttling
    pub capacity: u64,
    pub window_ms: u64,
}

impl ThrottleConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            capacity: 60_000,
            window_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Append-only audit file; `None` keeps the audit trail in memory only
    pub path: Option<String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: Some("pub_audit.log".to_string()),
        }
    }
}

/// Top-level publish gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub http_addr: String,
    pub pool: BrokerPoolConfig,
    pub throttle: ThrottleConfig,
    pub audit: AuditConfig,
    /// Largest accepted message body in bytes
    pub max_pub_size: usize,
    /// Concurrent publish connections accepted; 0 means unlimited
    pub max_clients: usize,
    pub enable_client_stats: bool,
    pub disable_metrics: bool,
    pub shutdown_drain_ms: u64,
    pub reap_interval_ms: u64,
}

impl GatewayConfig {
    pub fn shutdown_drain(&self) -> Duration {
        Duration::from_millis(self.shutdown_drain_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:9191".to_string(),
            pool: BrokerPoolConfig::default(),
            throttle: ThrottleConfig::default(),
            audit: AuditConfig::default(),
            max_pub_size: 256 << 10,
            max_clients: 0,
            enable_client_stats: false,
            disable_metrics: false,
            shutdown_drain_ms: 30_000,
            reap_interval_ms: 5_000,
        }
    }
}

// ============================================================================
// Environment Helpers
// ============================================================================

pub fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

pub fn env_or_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Split a comma separated broker list, dropping blanks
pub fn parse_broker_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl GatewayConfig {
    /// Build configuration from `GW_*` environment variables over the defaults
    pub fn from_env() -> Self {
        let defaults = GatewayConfig::default();
        let pool_defaults = defaults.pool.clone();

        let brokers = std::env::var("GW_BROKERS")
            .map(|v| parse_broker_list(&v))
            .ok()
            .filter(|b| !b.is_empty())
            .unwrap_or(pool_defaults.brokers);

        let pool = BrokerPoolConfig {
            brokers,
            max_size: env_or_parse("GW_POOL_MAX_SIZE", pool_defaults.max_size),
            max_idle: env_or_parse("GW_POOL_MAX_IDLE", pool_defaults.max_idle),
            idle_timeout_ms: env_or_parse::<u64>("GW_POOL_IDLE_TIMEOUT_SECS", pool_defaults.idle_timeout_ms / 1000) * 1000,
            max_lifetime_ms: env_or_parse::<u64>("GW_POOL_MAX_LIFETIME_SECS", pool_defaults.max_lifetime_ms / 1000) * 1000,
            acquire_timeout_ms: env_or_parse("GW_POOL_ACQUIRE_TIMEOUT_MS", pool_defaults.acquire_timeout_ms),
            connect_timeout_ms: env_or_parse("GW_CONNECT_TIMEOUT_MS", pool_defaults.connect_timeout_ms),
        };

        let throttle = ThrottleConfig {
            capacity: env_or_parse("GW_PUB_QPS_LIMIT", defaults.throttle.capacity),
            window_ms: env_or_parse::<u64>("GW_PUB_QPS_WINDOW_SECS", defaults.throttle.window_ms / 1000) * 1000,
        };

        let audit_path = env_or("GW_AUDIT_LOG", "pub_audit.log");
        let audit = AuditConfig {
            path: if audit_path.is_empty() { None } else { Some(audit_path) },
        };

        Self {
            http_addr: env_or("GW_HTTP_ADDR", &defaults.http_addr),
            pool,
            throttle,
            audit,
            max_pub_size: env_or_parse("GW_MAX_PUB_SIZE", defaults.max_pub_size),
            max_clients: env_or_parse("GW_MAX_CLIENTS", defaults.max_clients),
            enable_client_stats: env_or_parse("GW_CLIENT_STATS", defaults.enable_client_stats),
            disable_metrics: env_or_parse("GW_DISABLE_METRICS", defaults.disable_metrics),
            shutdown_drain_ms: env_or_parse::<u64>("GW_SHUTDOWN_DRAIN_SECS", defaults.shutdown_drain_ms / 1000) * 1000,
            reap_interval_ms: env_or_parse::<u64>("GW_REAP_INTERVAL_SECS", defaults.reap_interval_ms / 1000) * 1000,
        }
    }

    /// Reject configurations the gateway cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.brokers.is_empty() {
            return Err(ConfigError::Invalid("broker list is empty".to_string()));
        }
        if self.pool.max_size == 0 {
            return Err(ConfigError::Invalid("pool max size must be positive".to_string()));
        }
        if self.pool.max_idle > self.pool.max_size {
            return Err(ConfigError::Invalid(format!(
                "pool max idle {} exceeds max size {}",
                self.pool.max_idle, self.pool.max_size
            )));
        }
        if self.throttle.is_enabled() && self.throttle.window_ms == 0 {
            return Err(ConfigError::Invalid("throttle window must be positive".to_string()));
        }
        if self.max_pub_size == 0 {
            return Err(ConfigError::Invalid("max pub size must be positive".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Publish Types
// ============================================================================

/// Outcome recorded for each publish attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishOutcome {
    Ok,
    Throttled,
    PoolExhausted,
    PoolClosed,
    ConnectFailed,
    BrokerWriteFailed,
    Rejected,
    /// The caller went away before the attempt completed
    Cancelled,
}

impl PublishOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublishOutcome::Ok => "ok",
            PublishOutcome::Throttled => "throttled",
            PublishOutcome::PoolExhausted => "pool_exhausted",
            PublishOutcome::PoolClosed => "pool_closed",
            PublishOutcome::ConnectFailed => "connect_failed",
            PublishOutcome::BrokerWriteFailed => "broker_write_failed",
            PublishOutcome::Rejected => "rejected",
            PublishOutcome::Cancelled => "cancelled",
        }
    }
}

// ============================================================================
// Health & Stats Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub name: String,
    pub max_size: usize,
    pub max_idle: usize,
    pub idle: usize,
    pub checked_out: usize,
    pub waiters: usize,
    pub created: u64,
    pub destroyed: u64,
    pub closed: bool,
}

/// Per-publisher statistics, keyed by remote address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientStats {
    pub remote_addr: String,
    pub messages: u64,
    pub bytes: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayStats {
    pub pool: PoolStats,
    pub pool_version: u64,
    pub brokers: Vec<String>,
    pub concurrent_connections: i64,
    pub total_connections: u64,
    /// Connections refused because `max_clients` was reached
    pub rejected_connections: u64,
    pub in_flight: usize,
    pub throttle_keys: usize,
    pub clients: Vec<ClientStats>,
}

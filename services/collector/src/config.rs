//! Collector configuration from environment variables

use std::str::FromStr;
use std::time::Duration;

use rolling_cache::{WindowConfig, DEFAULT_REST_URL};

pub const DEFAULT_WS_URL: &str = "wss://stream.binance.com:9443/ws";

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Name carried in this process's presence announcement.
    pub collector_id: String,
    pub redis_url: String,
    /// Base of the per-stream WebSocket endpoints (`{ws_url}/{stream}`).
    pub ws_url: String,
    pub rest_url: String,
    pub window: WindowConfig,
    /// Bound on a single upstream connection attempt.
    pub connect_timeout: Duration,
    /// Delay before reconnecting a faulted stream that still has demand.
    pub reconnect_backoff: Duration,
    /// Delay between attempts while the broker is unreachable.
    pub broker_retry: Duration,
    pub stats_interval: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            collector_id: "collector".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
            rest_url: DEFAULT_REST_URL.to_string(),
            window: WindowConfig::default(),
            connect_timeout: Duration::from_secs(5),
            reconnect_backoff: Duration::from_secs(5),
            broker_retry: Duration::from_secs(5),
            stats_interval: Duration::from_secs(60),
        }
    }
}

impl CollectorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let window = WindowConfig {
            capacity: env_parse("CACHE_CAPACITY", defaults.window.capacity),
            ttl: Duration::from_secs(env_parse("CACHE_TTL_SECS", defaults.window.ttl.as_secs())),
            ..defaults.window.clone()
        };

        Self {
            collector_id: env_string("COLLECTOR_ID", &defaults.collector_id),
            redis_url: env_string("REDIS_URL", &defaults.redis_url),
            ws_url: env_string("BINANCE_WS_URL", &defaults.ws_url),
            rest_url: env_string("BINANCE_REST_URL", &defaults.rest_url),
            window,
            connect_timeout: env_millis("CONNECT_TIMEOUT_MS", defaults.connect_timeout),
            reconnect_backoff: env_millis("RECONNECT_BACKOFF_MS", defaults.reconnect_backoff),
            broker_retry: env_millis("BROKER_RETRY_MS", defaults.broker_retry),
            stats_interval: Duration::from_secs(env_parse(
                "STATS_INTERVAL_SECS",
                defaults.stats_interval.as_secs(),
            )),
        }
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_string(name: &str, default: &str) -> String {
    env_value(name).unwrap_or_else(|| default.to_string())
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    match env_value(name) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(var = name, value = %raw, "Ignoring unparsable setting");
            default
        }),
        None => default,
    }
}

fn env_millis(name: &str, default: Duration) -> Duration {
    Duration::from_millis(env_parse(name, default.as_millis() as u64))
}

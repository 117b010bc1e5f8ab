//! Gateway configuration
//!
//! Every setting comes from an environment variable with a typed fallback.
//! Values are trimmed; empty or unparsable values fall back to the default.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use rolling_cache::{WindowConfig, DEFAULT_REST_URL};

use crate::session::{DropPolicy, SessionConfig};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind: SocketAddr,
    /// Origin stamped on every control command this instance sends.
    pub gateway_id: String,
    pub redis_url: String,
    pub rest_url: String,
    pub window: WindowConfig,
    pub session: SessionConfig,
    pub broker_retry: Duration,
    pub stats_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 3001)),
            gateway_id: "gateway".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            rest_url: DEFAULT_REST_URL.to_string(),
            window: WindowConfig::default(),
            session: SessionConfig::default(),
            broker_retry: Duration::from_secs(5),
            stats_interval: Duration::from_secs(30),
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let vars = Vars { lookup };
        let defaults = Self::default();

        let window = WindowConfig {
            capacity: vars.parse("CACHE_CAPACITY", defaults.window.capacity),
            ttl: Duration::from_secs(vars.parse("CACHE_TTL_SECS", defaults.window.ttl.as_secs())),
            history_limit: vars.parse("HISTORY_LIMIT", defaults.window.history_limit),
            load_timeout: vars.millis("LOADER_TIMEOUT_MS", defaults.window.load_timeout),
        };

        let session = SessionConfig {
            queue_capacity: vars.parse("SESSION_QUEUE_CAPACITY", defaults.session.queue_capacity),
            drop_policy: vars.parse("SESSION_DROP_POLICY", defaults.session.drop_policy),
            max_subscriptions: vars.parse(
                "MAX_SUBSCRIPTIONS_PER_SESSION",
                defaults.session.max_subscriptions,
            ),
            messages_per_second: vars.parse("SESSION_RATE_LIMIT", defaults.session.messages_per_second),
        };

        Self {
            bind: vars.parse("GATEWAY_BIND", defaults.bind),
            gateway_id: vars.string("GATEWAY_ID", &defaults.gateway_id),
            redis_url: vars.string("REDIS_URL", &defaults.redis_url),
            rest_url: vars.string("BINANCE_REST_URL", &defaults.rest_url),
            window,
            session,
            broker_retry: vars.millis("BROKER_RETRY_MS", defaults.broker_retry),
            stats_interval: defaults.stats_interval,
        }
    }

    /// Origin used by the manual force-start/force-stop endpoints.
    pub fn manual_origin(&self) -> String {
        format!("{}:manual", self.gateway_id)
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn value(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, name: &str, default: &str) -> String {
        self.value(name).unwrap_or_else(|| default.to_string())
    }

    fn parse<T: FromStr>(&self, name: &str, default: T) -> T {
        let Some(raw) = self.value(name) else {
            return default;
        };
        raw.parse().unwrap_or_else(|_| {
            tracing::warn!(var = name, value = %raw, "Ignoring unparsable setting");
            default
        })
    }

    fn millis(&self, name: &str, default: Duration) -> Duration {
        Duration::from_millis(self.parse(name, default.as_millis() as u64))
    }
}

impl FromStr for DropPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "disconnect" => Ok(DropPolicy::Disconnect),
            "drop_oldest" | "drop-oldest" => Ok(DropPolicy::DropOldest),
            other => Err(format!("unknown drop policy {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> GatewayConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        GatewayConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = from_pairs(&[]);
        assert_eq!(config.bind.port(), 3001);
        assert_eq!(config.gateway_id, "gateway");
        assert_eq!(config.window.history_limit, 1000);
        assert_eq!(config.session.queue_capacity, 1024);
        assert_eq!(config.session.max_subscriptions, 50);
        assert_eq!(config.session.drop_policy, DropPolicy::Disconnect);
        assert_eq!(config.stats_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_overrides() {
        let config = from_pairs(&[
            ("GATEWAY_BIND", "127.0.0.1:4000"),
            ("GATEWAY_ID", " gw-7 "),
            ("CACHE_CAPACITY", "500"),
            ("LOADER_TIMEOUT_MS", "250"),
            ("SESSION_DROP_POLICY", "drop_oldest"),
            ("SESSION_RATE_LIMIT", "5"),
        ]);
        assert_eq!(config.bind, "127.0.0.1:4000".parse().unwrap());
        assert_eq!(config.gateway_id, "gw-7");
        assert_eq!(config.manual_origin(), "gw-7:manual");
        assert_eq!(config.window.capacity, 500);
        assert_eq!(config.window.load_timeout, Duration::from_millis(250));
        assert_eq!(config.session.drop_policy, DropPolicy::DropOldest);
        assert_eq!(config.session.messages_per_second, 5);
    }

    #[test]
    fn test_bad_values_fall_back() {
        let config = from_pairs(&[
            ("GATEWAY_BIND", "not-an-address"),
            ("CACHE_CAPACITY", "lots"),
            ("GATEWAY_ID", "   "),
            ("SESSION_DROP_POLICY", "shrug"),
        ]);
        assert_eq!(config.bind.port(), 3001);
        assert_eq!(config.window.capacity, 1000);
        assert_eq!(config.gateway_id, "gateway");
        assert_eq!(config.session.drop_policy, DropPolicy::Disconnect);
    }
}

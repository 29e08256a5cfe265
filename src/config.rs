//! Typed view over the runtime's environment/config surface.
//!
//! Generalizes the ad hoc settings access the teacher scatters through its
//! executor and resilience modules into one struct, read once at startup.

use std::time::Duration;

/// Runtime configuration, constructible from the environment or defaults.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Maximum number of handlers dispatched concurrently per execution.
    pub max_concurrent: usize,
    /// Path to the durable state store, if file-backed.
    pub state_db_path: Option<String>,
    /// Poll interval used while waiting for in-flight handlers to signal.
    pub node_ready_poll_interval: Duration,
    /// Grace period granted to in-flight handlers after a cancel signal.
    pub cancel_grace_period: Duration,
    /// TTL for the per-execution cache entry after it goes terminal.
    pub cache_ttl: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            state_db_path: None,
            node_ready_poll_interval: Duration::from_millis(10),
            cancel_grace_period: Duration::from_secs(5),
            cache_ttl: Duration::from_secs(3600),
        }
    }
}

impl RuntimeConfig {
    /// Build configuration from environment variables, falling back to
    /// documented defaults on missing or unparseable values.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_concurrent: parse_env_or("MAX_CONCURRENT", defaults.max_concurrent),
            state_db_path: std::env::var("STATE_DB_PATH").ok(),
            node_ready_poll_interval: Duration::from_millis(parse_env_or(
                "NODE_READY_POLL_INTERVAL",
                defaults.node_ready_poll_interval.as_millis() as u64,
            )),
            cancel_grace_period: Duration::from_secs(parse_env_or(
                "CANCEL_GRACE_PERIOD",
                defaults.cancel_grace_period.as_secs(),
            )),
            cache_ttl: Duration::from_secs(parse_env_or(
                "CACHE_TTL",
                defaults.cache_ttl.as_secs(),
            )),
        }
    }
}

fn parse_env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, raw, "failed to parse env var, using default");
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.max_concurrent, 10);
        assert_eq!(cfg.node_ready_poll_interval, Duration::from_millis(10));
        assert_eq!(cfg.cancel_grace_period, Duration::from_secs(5));
        assert_eq!(cfg.cache_ttl, Duration::from_secs(3600));
        assert!(cfg.state_db_path.is_none());
    }

    #[test]
    fn from_env_falls_back_on_missing_vars() {
        std::env::remove_var("MAX_CONCURRENT");
        let cfg = RuntimeConfig::from_env();
        assert_eq!(cfg.max_concurrent, 10);
    }
}

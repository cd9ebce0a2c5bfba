//! Server configuration and loading.
//!
//! Loading flow:
//! 1. Start with [`ServerConfig::default()`]
//! 2. If the config file exists, deep-merge its values over the defaults
//! 3. Apply `WSMUX_*` environment variable overrides (highest priority)

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use wsmux_core::MergeStrategy;

use crate::error::ConfigError;

/// Configuration for the WebSocket server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrently tracked connections.
    pub max_connections: usize,
    /// Capacity of each connection's outbound queue.
    pub outbound_queue: usize,
    /// Server-initiated ping interval in seconds (`0` disables).
    pub ping_interval_secs: u64,
    /// How long `close()` waits for the close frame to be written.
    pub close_timeout_ms: u64,
    /// How long shutdown waits for background tasks.
    pub shutdown_timeout_secs: u64,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Merge primitive backing the event stream.
    pub merge_strategy: MergeStrategy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 1024,
            outbound_queue: 256,
            ping_interval_secs: 0,
            close_timeout_ms: 1000,
            shutdown_timeout_secs: 10,
            max_message_size: 16 * 1024 * 1024,
            merge_strategy: MergeStrategy::Queue,
        }
    }
}

impl ServerConfig {
    /// `host:port` string handed to the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Server ping period; `None` when disabled.
    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_secs > 0).then(|| Duration::from_secs(self.ping_interval_secs))
    }

    /// How long `close` waits for the writer to acknowledge.
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Upper bound on waiting for background tasks at shutdown.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Load config from `path` (if given and present) with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_config(path: Option<&Path>) -> Result<ServerConfig, ConfigError> {
    let defaults = serde_json::to_value(ServerConfig::default())?;

    let merged = match path {
        Some(path) if path.exists() => {
            debug!(?path, "loading config from file");
            let content = std::fs::read_to_string(path)?;
            let user: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, user)
        }
        Some(path) => {
            debug!(?path, "config file not found, using defaults");
            defaults
        }
        None => defaults,
    };

    let mut config: ServerConfig = serde_json::from_value(merged)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Recursive deep merge of two JSON values.
///
/// Objects merge per key, arrays and primitives are replaced, and nulls in
/// `source` are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `WSMUX_*` overrides from the process environment.
pub fn apply_env_overrides(config: &mut ServerConfig) {
    apply_overrides_from(config, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`. Invalid values are ignored.
pub fn apply_overrides_from(config: &mut ServerConfig, lookup: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read("WSMUX_HOST") {
        config.host = v;
    }
    if let Some(v) = read("WSMUX_PORT") {
        match parse_range::<u16>(&v, 0, u16::MAX) {
            Some(port) => config.port = port,
            None => warn!(key = "WSMUX_PORT", value = %v, "invalid env var, ignoring"),
        }
    }
    if let Some(v) = read("WSMUX_MAX_CONNECTIONS") {
        match parse_range::<usize>(&v, 1, 1_000_000) {
            Some(max) => config.max_connections = max,
            None => warn!(key = "WSMUX_MAX_CONNECTIONS", value = %v, "invalid env var, ignoring"),
        }
    }
    if let Some(v) = read("WSMUX_PING_INTERVAL") {
        match parse_range::<u64>(&v, 0, 3600) {
            Some(secs) => config.ping_interval_secs = secs,
            None => warn!(key = "WSMUX_PING_INTERVAL", value = %v, "invalid env var, ignoring"),
        }
    }
    if let Some(v) = read("WSMUX_MERGE_STRATEGY") {
        match MergeStrategy::parse(&v) {
            Some(strategy) => config.merge_strategy = strategy,
            None => warn!(key = "WSMUX_MERGE_STRATEGY", value = %v, "invalid env var, ignoring"),
        }
    }
}

/// Parse `val` and accept it only within `[min, max]`.
pub fn parse_range<N>(val: &str, min: N, max: N) -> Option<N>
where
    N: std::str::FromStr + PartialOrd,
{
    let n: N = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

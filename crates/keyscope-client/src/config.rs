//! Client configuration loaded from environment variables.
//!
//! Every setting has a default so the monitor starts with zero
//! configuration against a local backend.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use keyscope_net::TransportConfig;
use keyscope_shared::constants::{
    DEFAULT_BACKEND_URL, DEFAULT_MAX_MESSAGES, DEFAULT_RELAY_URL, KEEPALIVE_INTERVAL,
    RECONNECT_DELAY,
};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint of the pub/sub relay.
    /// Env: `RELAY_URL`
    /// Default: `ws://127.0.0.1:3001/ws`
    pub relay_url: String,

    /// HTTP endpoint of the backend that owns connection sessions.
    /// Env: `BACKEND_URL`
    /// Default: `http://127.0.0.1:3001`
    pub backend_url: String,

    /// Directory holding the cache snapshot and the SQLite backup.
    /// Env: `DATA_DIR`
    /// Default: `None`, meaning the platform data directory.
    pub data_dir: Option<PathBuf>,

    /// Cap of the in-memory message list of one connection.
    /// Env: `MAX_MESSAGES`
    /// Default: `100`
    pub max_messages: usize,

    /// Env: `RECONNECT_DELAY_SECS`
    /// Default: `5`
    pub reconnect_delay: Duration,

    /// Env: `KEEPALIVE_SECS`
    /// Default: `30`
    pub keepalive_interval: Duration,

    /// Channels the monitor binary subscribes to after startup.
    /// Env: `SUBSCRIBE_CHANNELS` (comma-separated)
    pub subscribe_channels: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            data_dir: None,
            max_messages: DEFAULT_MAX_MESSAGES,
            reconnect_delay: RECONNECT_DELAY,
            keepalive_interval: KEEPALIVE_INTERVAL,
            subscribe_channels: Vec::new(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = var("RELAY_URL") {
            config.relay_url = url;
        }

        if let Some(url) = var("BACKEND_URL") {
            config.backend_url = url.trim_end_matches('/').to_string();
        }

        if let Some(dir) = var("DATA_DIR") {
            if !dir.is_empty() {
                config.data_dir = Some(PathBuf::from(dir));
            }
        }

        if let Some(val) = var("MAX_MESSAGES") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.max_messages = n,
                _ => warn!(value = %val, "Invalid MAX_MESSAGES, using default"),
            }
        }

        if let Some(val) = var("RECONNECT_DELAY_SECS") {
            match parse_secs(&val) {
                Some(d) => config.reconnect_delay = d,
                None => warn!(value = %val, "Invalid RECONNECT_DELAY_SECS, using default"),
            }
        }

        if let Some(val) = var("KEEPALIVE_SECS") {
            match parse_secs(&val) {
                Some(d) => config.keepalive_interval = d,
                None => warn!(value = %val, "Invalid KEEPALIVE_SECS, using default"),
            }
        }

        if let Some(val) = var("SUBSCRIBE_CHANNELS") {
            config.subscribe_channels = val
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(String::from)
                .collect();
        }

        config
    }

    /// Transport settings derived from this configuration.
    pub fn transport(&self) -> TransportConfig {
        let mut transport = TransportConfig::new(self.relay_url.clone());
        transport.reconnect_delay = self.reconnect_delay;
        transport.keepalive_interval = self.keepalive_interval;
        transport
    }
}

fn parse_secs(val: &str) -> Option<Duration> {
    match val.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_map(vars: &[(&str, &str)]) -> ClientConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ClientConfig::from_vars(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.relay_url, "ws://127.0.0.1:3001/ws");
        assert_eq!(config.max_messages, 100);
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert!(config.data_dir.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = from_map(&[
            ("BACKEND_URL", "http://backend:8080/"),
            ("MAX_MESSAGES", "25"),
            ("RECONNECT_DELAY_SECS", "2"),
            ("SUBSCRIBE_CHANNELS", "news, alerts,,"),
        ]);
        assert_eq!(config.backend_url, "http://backend:8080");
        assert_eq!(config.max_messages, 25);
        assert_eq!(config.transport().reconnect_delay, Duration::from_secs(2));
        assert_eq!(config.subscribe_channels, vec!["news", "alerts"]);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = from_map(&[("MAX_MESSAGES", "0"), ("KEEPALIVE_SECS", "soon")]);
        assert_eq!(config.max_messages, 100);
        assert_eq!(config.keepalive_interval, Duration::from_secs(30));
    }
}

//! Gateway configuration

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::{GatewayError, DEFAULT_HOST, DEFAULT_PORT};

/// Main gateway configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Server-initiated ping period
    pub heartbeat_interval_secs: u64,

    /// Observers silent for longer than this are evicted
    pub heartbeat_timeout_secs: u64,

    /// Frames queued per observer before it is marked for resync
    pub observer_buffer: usize,

    /// Request ids remembered per connection for duplicate detection
    pub dedup_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            heartbeat_interval_secs: 15,
            heartbeat_timeout_secs: 45,
            observer_buffer: 256,
            dedup_capacity: 256,
        }
    }
}

impl GatewayConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_heartbeat(mut self, interval_secs: u64, timeout_secs: u64) -> Self {
        self.heartbeat_interval_secs = interval_secs;
        self.heartbeat_timeout_secs = timeout_secs;
        self
    }

    pub fn with_observer_buffer(mut self, frames: usize) -> Self {
        self.observer_buffer = frames;
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs.max(1))
    }

    /// Get the socket address
    pub fn socket_addr(&self) -> crate::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| GatewayError::InvalidConfig(format!("bad listen address: {}", e)))
    }

    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn to_file(&self, path: impl AsRef<Path>) -> crate::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.host, DEFAULT_HOST);
        assert!(config.heartbeat_timeout_secs > config.heartbeat_interval_secs);
        assert_eq!(config.socket_addr().unwrap().port(), 8766);
    }

    #[test]
    fn test_config_builder() {
        let config = GatewayConfig::new()
            .with_host("0.0.0.0")
            .with_port(9000)
            .with_heartbeat(1, 3)
            .with_observer_buffer(8);

        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.heartbeat_timeout(), Duration::from_secs(3));
        assert_eq!(config.observer_buffer, 8);
    }

    #[test]
    fn test_bad_host_is_config_error() {
        let err = GatewayConfig::new().with_host("not a host").socket_addr().unwrap_err();
        assert!(matches!(err, GatewayError::InvalidConfig(_)));
    }

    #[test]
    fn test_file_roundtrip_with_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.json");
        GatewayConfig::new().with_port(9100).to_file(&path).unwrap();
        assert_eq!(GatewayConfig::from_file(&path).unwrap().port, 9100);

        std::fs::write(&path, r#"{"port": 9200}"#).unwrap();
        let parsed = GatewayConfig::from_file(&path).unwrap();
        assert_eq!(parsed.port, 9200);
        assert_eq!(parsed.host, DEFAULT_HOST);
    }
}

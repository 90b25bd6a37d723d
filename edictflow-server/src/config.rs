//! Server configuration

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, ServerError};

const DEFAULT_PORT: u16 = 8420;
const DEFAULT_SWEEP_SECS: u64 = 30;
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_OUTBOUND_BUFFER: usize = 256;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: u16,
    /// Enable CORS
    pub cors_enabled: bool,
    /// How often the sweeper auto-reverts expired temporary changes
    pub sweep_interval: Duration,
    /// Per-frame write deadline on a session
    pub write_timeout: Duration,
    /// Keepalive ping period on a session
    pub ping_interval: Duration,
    /// Outbound frames buffered per session before sends are dropped
    pub outbound_buffer: usize,
    /// SQLite database; in-memory store when absent
    pub database_path: Option<PathBuf>,
    /// JSON bearer token map
    pub tokens_path: Option<PathBuf>,
    /// JSON team/member/permission directory
    pub directory_path: Option<PathBuf>,
}

impl ServerConfig {
    /// Create a new configuration builder
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// Read `EDICTFLOW_*` environment variables over the defaults
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut builder = Self::builder();
        if let Some(port) = lookup("EDICTFLOW_PORT") {
            let port = port
                .parse()
                .map_err(|_| ServerError::Config(format!("EDICTFLOW_PORT is not a port: {}", port)))?;
            builder = builder.port(port);
        }
        if let Some(secs) = lookup("EDICTFLOW_SWEEP_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                ServerError::Config(format!("EDICTFLOW_SWEEP_SECS is not a number: {}", secs))
            })?;
            builder = builder.sweep_interval(Duration::from_secs(secs));
        }
        if let Some(path) = lookup("EDICTFLOW_DB") {
            builder = builder.database_path(path);
        }
        if let Some(path) = lookup("EDICTFLOW_TOKENS") {
            builder = builder.tokens_path(path);
        }
        if let Some(path) = lookup("EDICTFLOW_DIRECTORY") {
            builder = builder.directory_path(path);
        }
        Ok(builder.build())
    }

    /// How long a session reader waits for any frame before giving up
    pub fn read_timeout(&self) -> Duration {
        self.ping_interval * 2 + self.write_timeout
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Builder for ServerConfig
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    port: Option<u16>,
    cors_enabled: Option<bool>,
    sweep_interval: Option<Duration>,
    write_timeout: Option<Duration>,
    ping_interval: Option<Duration>,
    outbound_buffer: Option<usize>,
    database_path: Option<PathBuf>,
    tokens_path: Option<PathBuf>,
    directory_path: Option<PathBuf>,
}

impl ServerConfigBuilder {
    /// Set the port
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Enable or disable CORS
    pub fn cors(mut self, enabled: bool) -> Self {
        self.cors_enabled = Some(enabled);
        self
    }

    /// Sweep period; clamped to at most one minute
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = Some(interval);
        self
    }

    pub fn outbound_buffer(mut self, frames: usize) -> Self {
        self.outbound_buffer = Some(frames);
        self
    }

    pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    pub fn tokens_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.tokens_path = Some(path.into());
        self
    }

    pub fn directory_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.directory_path = Some(path.into());
        self
    }

    /// Build the configuration
    pub fn build(self) -> ServerConfig {
        let sweep = self
            .sweep_interval
            .unwrap_or(Duration::from_secs(DEFAULT_SWEEP_SECS))
            .clamp(Duration::from_secs(1), Duration::from_secs(60));
        ServerConfig {
            port: self.port.unwrap_or(DEFAULT_PORT),
            cors_enabled: self.cors_enabled.unwrap_or(true),
            sweep_interval: sweep,
            write_timeout: self.write_timeout.unwrap_or(DEFAULT_WRITE_TIMEOUT),
            ping_interval: self.ping_interval.unwrap_or(DEFAULT_PING_INTERVAL),
            outbound_buffer: self.outbound_buffer.unwrap_or(DEFAULT_OUTBOUND_BUFFER).max(1),
            database_path: self.database_path,
            tokens_path: self.tokens_path,
            directory_path: self.directory_path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8420);
        assert_eq!(config.write_timeout, Duration::from_secs(10));
        assert_eq!(config.ping_interval, Duration::from_secs(30));
        assert_eq!(config.outbound_buffer, 256);
        assert_eq!(config.sweep_interval, Duration::from_secs(30));
        assert!(config.database_path.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("EDICTFLOW_PORT", "9000"),
            ("EDICTFLOW_DB", "/var/lib/edictflow.db"),
            ("EDICTFLOW_SWEEP_SECS", "5"),
        ]))
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.sweep_interval, Duration::from_secs(5));
        assert_eq!(
            config.database_path,
            Some(PathBuf::from("/var/lib/edictflow.db"))
        );
    }

    #[test]
    fn test_sweep_runs_at_least_once_per_minute() {
        let config = ServerConfig::builder()
            .sweep_interval(Duration::from_secs(600))
            .build();
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_bad_port_is_config_error() {
        let err = ServerConfig::from_lookup(lookup(&[("EDICTFLOW_PORT", "eighty")])).unwrap_err();
        assert!(matches!(err, ServerError::Config(_)));
    }
}

//! Agent configuration
//!
//! Settings come from `config.json` in the agent home directory, with every
//! field optional. Values stored in the local store's key/value table (set by
//! `edictflow-agent config set`) override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

/// Environment variable overriding the agent home directory
pub const HOME_ENV: &str = "EDICTFLOW_HOME";

/// Keys the store's config table may override
pub const KEY_SERVER_URL: &str = "server_url";
pub const KEY_MANAGED_FILENAME: &str = "managed_filename";

/// Main agent configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Controller base URL (`http://` or `https://`)
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Basename of the managed file inside each project
    #[serde(default = "default_managed_filename")]
    pub managed_filename: String,

    /// Seconds between heartbeats while connected
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Per-frame write deadline on the session
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub backoff: BackoffConfig,
}

fn default_server_url() -> String {
    "http://localhost:8420".to_string()
}
fn default_managed_filename() -> String {
    "CLAUDE.md".to_string()
}
fn default_heartbeat_interval() -> u64 { 30 }
fn default_write_timeout() -> u64 { 10 }

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            managed_filename: default_managed_filename(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            write_timeout_secs: default_write_timeout(),
            queue: QueueConfig::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Outbound queue configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Send attempts before an entry is retired
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Entries older than this are retired regardless of attempts
    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,

    /// Seconds between janitor passes
    #[serde(default = "default_janitor_interval")]
    pub janitor_interval_secs: u64,

    /// Seconds an entry sent on a live link waits for its ack before it is sent again
    #[serde(default = "default_resend_after")]
    pub resend_after_secs: u64,
}

fn default_max_attempts() -> u32 { 3 }
fn default_max_age() -> u64 { 7 * 24 * 60 * 60 }
fn default_janitor_interval() -> u64 { 300 }
fn default_resend_after() -> u64 { 30 }

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            max_age_secs: default_max_age(),
            janitor_interval_secs: default_janitor_interval(),
            resend_after_secs: default_resend_after(),
        }
    }
}

/// Reconnect backoff configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_initial_backoff")]
    pub initial_secs: u64,

    #[serde(default = "default_max_backoff")]
    pub max_secs: u64,
}

fn default_initial_backoff() -> u64 { 1 }
fn default_max_backoff() -> u64 { 60 }

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_secs: default_initial_backoff(),
            max_secs: default_max_backoff(),
        }
    }
}

impl AgentConfig {
    /// Read `config.json` from `home`; a missing file yields the defaults
    pub fn load(home: &Path) -> Result<Self> {
        let path = home.join("config.json");
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| AgentError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply one key/value override from the store
    pub fn apply_override(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            KEY_SERVER_URL => self.server_url = value.to_string(),
            KEY_MANAGED_FILENAME => self.managed_filename = value.to_string(),
            other => {
                tracing::debug!(key = other, "ignoring unknown config override");
                return Ok(());
            }
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.server_url.starts_with("http://") || self.server_url.starts_with("https://")) {
            return Err(AgentError::Config(format!(
                "server_url must start with http:// or https://, got '{}'",
                self.server_url
            )));
        }
        if self.managed_filename.is_empty() || self.managed_filename.contains('/') {
            return Err(AgentError::Config(format!(
                "managed_filename must be a bare file name, got '{}'",
                self.managed_filename
            )));
        }
        if self.backoff.initial_secs == 0 || self.backoff.max_secs < self.backoff.initial_secs {
            return Err(AgentError::Config("backoff bounds are inconsistent".into()));
        }
        if self.queue.max_attempts == 0 {
            return Err(AgentError::Config("queue.max_attempts must be at least 1".into()));
        }
        if self.queue.resend_after_secs == 0 {
            return Err(AgentError::Config("queue.resend_after_secs must be at least 1".into()));
        }
        Ok(())
    }

    /// Controller base URL without a trailing slash
    pub fn http_url(&self) -> &str {
        self.server_url.trim_end_matches('/')
    }

    /// WebSocket session endpoint derived from the base URL
    pub fn session_url(&self) -> String {
        let base = self.http_url();
        let ws = match base.strip_prefix("https://") {
            Some(rest) => format!("wss://{}", rest),
            None => format!("ws://{}", base.trim_start_matches("http://")),
        };
        format!("{}/api/v1/ws", ws)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs.max(1))
    }
}

/// Where the agent keeps its store, socket and PID file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentPaths {
    pub home: PathBuf,
}

impl AgentPaths {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    /// `$EDICTFLOW_HOME`, else `~/.edictflow`
    pub fn resolve() -> Result<Self> {
        Self::resolve_with(std::env::var_os(HOME_ENV).map(PathBuf::from), dirs::home_dir())
    }

    fn resolve_with(override_dir: Option<PathBuf>, home_dir: Option<PathBuf>) -> Result<Self> {
        if let Some(dir) = override_dir.filter(|d| !d.as_os_str().is_empty()) {
            return Ok(Self::new(dir));
        }
        home_dir
            .map(|h| Self::new(h.join(".edictflow")))
            .ok_or_else(|| AgentError::Config("cannot determine the home directory".into()))
    }

    pub fn ensure(&self) -> Result<()> {
        std::fs::create_dir_all(&self.home)?;
        Ok(())
    }

    pub fn database(&self) -> PathBuf {
        self.home.join("agent.db")
    }

    pub fn socket(&self) -> PathBuf {
        self.home.join("agent.sock")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.home.join("agent.pid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.managed_filename, "CLAUDE.md");
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.queue.resend_after_secs, 30);
        assert_eq!(config.queue.max_age_secs, 604_800);
        assert_eq!(config.backoff.initial_secs, 1);
        assert_eq!(config.backoff.max_secs, 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"server_url": "https://policy.example.com/", "queue": {"max_attempts": 5}}"#,
        )
        .unwrap();
        let config = AgentConfig::load(dir.path()).unwrap();
        assert_eq!(config.queue.max_attempts, 5);
        assert_eq!(config.queue.janitor_interval_secs, 300);
        assert_eq!(config.session_url(), "wss://policy.example.com/api/v1/ws");
        assert_eq!(config.http_url(), "https://policy.example.com");
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(AgentConfig::load(dir.path()).unwrap(), AgentConfig::default());
    }

    #[test]
    fn test_session_url_plain_http() {
        let config = AgentConfig::default();
        assert_eq!(config.session_url(), "ws://localhost:8420/api/v1/ws");
    }

    #[test]
    fn test_overrides_are_validated() {
        let mut config = AgentConfig::default();
        config.apply_override(KEY_MANAGED_FILENAME, "AGENTS.md").unwrap();
        assert_eq!(config.managed_filename, "AGENTS.md");
        assert!(config.apply_override(KEY_SERVER_URL, "ftp://nope").is_err());
        config.apply_override("colour", "blue").unwrap();
    }

    #[test]
    fn test_paths_resolution() {
        let paths = AgentPaths::resolve_with(Some("/tmp/ef".into()), Some("/home/dev".into())).unwrap();
        assert_eq!(paths.database(), PathBuf::from("/tmp/ef/agent.db"));

        let paths = AgentPaths::resolve_with(None, Some("/home/dev".into())).unwrap();
        assert_eq!(paths.socket(), PathBuf::from("/home/dev/.edictflow/agent.sock"));
        assert!(AgentPaths::resolve_with(None, None).is_err());
    }
}

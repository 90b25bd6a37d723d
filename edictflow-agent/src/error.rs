//! Error types for the agent daemon

use edictflow_core::EdictError;
use thiserror::Error;

/// Result type for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors that can occur in the agent
#[derive(Error, Debug)]
pub enum AgentError {
    /// No credential stored; run `edictflow-agent login` first
    #[error("Not authenticated. Run `edictflow-agent login` first.")]
    NotAuthenticated,

    /// Stored credential has expired
    #[error("Credential expired at {0}")]
    CredentialExpired(String),

    /// Local store failed
    #[error("Store error: {0}")]
    Store(String),

    /// Connecting to or talking with the controller failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// The session closed underneath an operation
    #[error("Session closed")]
    SessionClosed,

    /// Path is not a registered project
    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    /// Local pending change doesn't exist
    #[error("Change not found: {0}")]
    ChangeNotFound(String),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// File watcher failed
    #[error("Watcher error: {0}")]
    Watch(#[from] notify::Error),

    /// Device authorization failed
    #[error("Authorization failed: {0}")]
    Auth(String),

    /// Shared core error (protocol, render)
    #[error(transparent)]
    Core(#[from] EdictError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for AgentError {
    fn from(err: rusqlite::Error) -> Self {
        AgentError::Store(err.to_string())
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        AgentError::Transport(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AgentError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        AgentError::Transport(err.to_string())
    }
}

impl AgentError {
    /// Errors that stop the daemon instead of being retried
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::NotAuthenticated
                | AgentError::CredentialExpired(_)
                | AgentError::Config(_)
        )
    }
}

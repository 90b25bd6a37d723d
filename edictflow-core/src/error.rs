//! Error types for Edictflow operations
//!
//! Every error maps onto one category of the propagation taxonomy:
//!
//! - **transient I/O**: store contention, storage and network failures
//! - **validation**: schema or contract violations
//! - **not found**: the target entity is absent
//! - **invalid state**: a state-machine precondition is unmet
//! - **permission denied**: the caller lacks the configured permission
//! - **conflict**: duplicate votes or attachments
//! - **fatal**: the process cannot continue
//!
//! Each variant also carries a stable error code (e.g. `RULE_NOT_FOUND`) and an
//! HTTP status for the server boundary.
//!
//! # Example
//!
//! ```rust
//! use edictflow_core::error::{EdictError, ErrorCategory};
//!
//! let err = EdictError::DuplicateVote {
//!     rule_id: "r-1".to_string(),
//!     voter_id: "alice".to_string(),
//! };
//! assert_eq!(err.category(), ErrorCategory::Conflict);
//! assert_eq!(err.error_code(), "DUPLICATE_VOTE");
//! assert_eq!(err.http_status_code(), 409);
//! assert!(!err.is_retryable());
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for Edictflow operations
pub type Result<T> = std::result::Result<T, EdictError>;

/// Error category for grouping related errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Network errors, store contention (503)
    TransientIo,
    /// Schema or contract violation (400)
    Validation,
    /// Target entity absent (404)
    NotFound,
    /// State-machine precondition unmet (422)
    InvalidState,
    /// Caller lacks the required permission (403)
    PermissionDenied,
    /// Duplicate vote or attachment (409)
    Conflict,
    /// Unrecoverable startup condition (500)
    Fatal,
    /// Bug (500)
    Internal,
}

/// Errors that can occur in Edictflow operations
#[derive(Error, Debug)]
pub enum EdictError {
    // ═══════════════════════════════════════════════════════════════════════
    // Not found
    // ═══════════════════════════════════════════════════════════════════════

    /// Rule with the specified ID doesn't exist
    #[error("Rule not found: '{rule_id}'")]
    RuleNotFound { rule_id: String },

    /// Agent is not registered with the controller
    #[error("Agent not found: '{agent_id}'. The agent must complete a handshake first.")]
    AgentNotFound { agent_id: String },

    /// Change request doesn't exist
    #[error("Change request not found: '{change_id}'")]
    ChangeNotFound { change_id: String },

    /// Exception request doesn't exist
    #[error("Exception request not found: '{exception_id}'")]
    ExceptionNotFound { exception_id: String },

    /// Team doesn't exist in the directory
    #[error("Team not found: '{team_id}'")]
    TeamNotFound { team_id: String },

    /// No approval configuration covers the rule's scope
    #[error("No approval configuration for scope '{scope}'")]
    ApprovalConfigNotFound { scope: String },

    // ═══════════════════════════════════════════════════════════════════════
    // Invalid state (state-machine preconditions)
    // ═══════════════════════════════════════════════════════════════════════

    /// A lifecycle transition is not permitted from the current status
    #[error("Invalid state: cannot {action} {entity} '{id}' while it is {status}")]
    InvalidState {
        entity: &'static str,
        id: String,
        status: String,
        action: &'static str,
    },

    /// Votes are only accepted on pending rules
    #[error("Rule '{rule_id}' is not pending approval (status: {status})")]
    NotPending { rule_id: String, status: String },

    /// Exceptions may only be requested for rejected or auto-reverted changes
    #[error("Change request '{change_id}' is not rejected (status: {status})")]
    NotRejected { change_id: String, status: String },

    // ═══════════════════════════════════════════════════════════════════════
    // Permission
    // ═══════════════════════════════════════════════════════════════════════

    /// Caller does not hold the permission named by the approval configuration
    #[error("User '{user_id}' lacks permission '{permission}'")]
    NoPermission { user_id: String, permission: String },

    // ═══════════════════════════════════════════════════════════════════════
    // Conflict
    // ═══════════════════════════════════════════════════════════════════════

    /// Voter already has an approval record for this rule
    #[error("Duplicate vote: '{voter_id}' already voted on rule '{rule_id}'")]
    DuplicateVote { rule_id: String, voter_id: String },

    /// Rule is already attached to the team
    #[error("Rule '{rule_id}' is already attached to team '{team_id}'")]
    DuplicateAttachment { rule_id: String, team_id: String },

    /// Entity with the same identity already exists
    #[error("{entity} already exists: '{id}'")]
    AlreadyExists { entity: &'static str, id: String },

    // ═══════════════════════════════════════════════════════════════════════
    // Validation
    // ═══════════════════════════════════════════════════════════════════════

    /// Input failed validation
    #[error("Validation failed: {reason}")]
    Validation { reason: String },

    /// Message envelope or payload is malformed
    #[error("Invalid message: {reason}")]
    InvalidMessage { reason: String },

    // ═══════════════════════════════════════════════════════════════════════
    // Transient I/O
    // ═══════════════════════════════════════════════════════════════════════

    /// JSON serialization or deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Durable store failed
    #[error("Storage error: {reason}")]
    Storage { reason: String },

    /// I/O operation failed
    #[error("IO error: {message}")]
    Io { message: String },

    /// Operation was cancelled through its cancellation handle
    #[error("Operation cancelled")]
    Cancelled,

    // ═══════════════════════════════════════════════════════════════════════
    // Fatal and internal
    // ═══════════════════════════════════════════════════════════════════════

    /// Unrecoverable condition; the process should log and exit
    #[error("Fatal: {reason}")]
    Fatal { reason: String },

    /// Internal error that shouldn't happen
    #[error("Internal error: {reason}. This is a bug; please report it.")]
    Internal { reason: String },
}

impl EdictError {
    /// Shorthand for a validation failure
    pub fn validation(reason: impl Into<String>) -> Self {
        EdictError::Validation {
            reason: reason.into(),
        }
    }

    /// Shorthand for a storage failure
    pub fn storage(reason: impl Into<String>) -> Self {
        EdictError::Storage {
            reason: reason.into(),
        }
    }

    /// Returns true if retrying the same operation might succeed
    ///
    /// Only transient I/O is retryable. Invalid-state, not-found and
    /// permission errors need a different input or a user action.
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::TransientIo
    }

    /// Returns true if this error is a client error (4xx equivalent)
    pub fn is_client_error(&self) -> bool {
        matches!(self.http_status_code(), 400..=499)
    }

    /// Returns the error category for grouping
    pub fn category(&self) -> ErrorCategory {
        match self {
            EdictError::RuleNotFound { .. }
            | EdictError::AgentNotFound { .. }
            | EdictError::ChangeNotFound { .. }
            | EdictError::ExceptionNotFound { .. }
            | EdictError::TeamNotFound { .. }
            | EdictError::ApprovalConfigNotFound { .. } => ErrorCategory::NotFound,

            EdictError::InvalidState { .. }
            | EdictError::NotPending { .. }
            | EdictError::NotRejected { .. } => ErrorCategory::InvalidState,

            EdictError::NoPermission { .. } => ErrorCategory::PermissionDenied,

            EdictError::DuplicateVote { .. }
            | EdictError::DuplicateAttachment { .. }
            | EdictError::AlreadyExists { .. } => ErrorCategory::Conflict,

            EdictError::Validation { .. } | EdictError::InvalidMessage { .. } => {
                ErrorCategory::Validation
            }

            EdictError::Json(_)
            | EdictError::Storage { .. }
            | EdictError::Io { .. }
            | EdictError::Cancelled => ErrorCategory::TransientIo,

            EdictError::Fatal { .. } => ErrorCategory::Fatal,
            EdictError::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// Returns the stable error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            EdictError::RuleNotFound { .. } => "RULE_NOT_FOUND",
            EdictError::AgentNotFound { .. } => "AGENT_NOT_FOUND",
            EdictError::ChangeNotFound { .. } => "CHANGE_NOT_FOUND",
            EdictError::ExceptionNotFound { .. } => "EXCEPTION_NOT_FOUND",
            EdictError::TeamNotFound { .. } => "TEAM_NOT_FOUND",
            EdictError::ApprovalConfigNotFound { .. } => "APPROVAL_CONFIG_NOT_FOUND",
            EdictError::InvalidState { .. } => "INVALID_STATE",
            EdictError::NotPending { .. } => "NOT_PENDING",
            EdictError::NotRejected { .. } => "NOT_REJECTED",
            EdictError::NoPermission { .. } => "NO_PERMISSION",
            EdictError::DuplicateVote { .. } => "DUPLICATE_VOTE",
            EdictError::DuplicateAttachment { .. } => "DUPLICATE_ATTACHMENT",
            EdictError::AlreadyExists { .. } => "ALREADY_EXISTS",
            EdictError::Validation { .. } => "VALIDATION_ERROR",
            EdictError::InvalidMessage { .. } => "INVALID_MESSAGE",
            EdictError::Json(_) => "JSON_ERROR",
            EdictError::Storage { .. } => "STORAGE_ERROR",
            EdictError::Io { .. } => "IO_ERROR",
            EdictError::Cancelled => "CANCELLED",
            EdictError::Fatal { .. } => "FATAL",
            EdictError::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// Returns the HTTP status code for this error
    pub fn http_status_code(&self) -> u16 {
        match self.category() {
            ErrorCategory::Validation => 400,
            ErrorCategory::PermissionDenied => 403,
            ErrorCategory::NotFound => 404,
            ErrorCategory::Conflict => 409,
            ErrorCategory::InvalidState => 422,
            ErrorCategory::TransientIo => 503,
            ErrorCategory::Fatal | ErrorCategory::Internal => 500,
        }
    }

    /// Converts this error to a JSON-serializable response object
    pub fn to_error_response(&self) -> ErrorResponse {
        ErrorResponse {
            error: ErrorDetail {
                code: self.error_code().to_string(),
                message: self.to_string(),
                category: self.category(),
                retryable: self.is_retryable(),
            },
        }
    }
}

impl From<std::io::Error> for EdictError {
    fn from(err: std::io::Error) -> Self {
        EdictError::Io {
            message: err.to_string(),
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for EdictError {
    fn from(err: rusqlite::Error) -> Self {
        EdictError::Storage {
            reason: err.to_string(),
        }
    }
}

/// JSON-serializable error response for APIs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error details
    pub error: ErrorDetail,
}

/// Error detail for JSON responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Stable error code (e.g., "RULE_NOT_FOUND")
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Error category
    pub category: ErrorCategory,
    /// Whether retry might succeed
    pub retryable: bool,
}

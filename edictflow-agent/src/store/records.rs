//! Rows held in the agent store

use chrono::{DateTime, Utc};
use edictflow_core::model::EnforcementMode;
use serde::{Deserialize, Serialize};

/// Bearer credential obtained through device authorization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRecord {
    pub token: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub user_id: String,
    pub agent_id: String,
}

impl AuthRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|e| e <= now).unwrap_or(false)
    }
}

/// A managed file the agent keeps in line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedFile {
    pub path: String,
    pub project_path: String,
    /// Rule the last reported edit touched
    pub rule_id: Option<String>,
    /// Hash of the last-known-good content
    pub baseline_hash: String,
}

/// One agent -> controller envelope awaiting acknowledgement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub seq: i64,
    pub ref_id: String,
    pub message_type: String,
    /// Encoded envelope, sent verbatim
    pub payload: String,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

/// Local view of a change request this agent reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalChangeStatus {
    Pending,
    Approved,
    Rejected,
    ExceptionGranted,
    ExceptionDenied,
}

impl LocalChangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocalChangeStatus::Pending => "pending",
            LocalChangeStatus::Approved => "approved",
            LocalChangeStatus::Rejected => "rejected",
            LocalChangeStatus::ExceptionGranted => "exception_granted",
            LocalChangeStatus::ExceptionDenied => "exception_denied",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => LocalChangeStatus::Pending,
            "approved" => LocalChangeStatus::Approved,
            "rejected" => LocalChangeStatus::Rejected,
            "exception_granted" => LocalChangeStatus::ExceptionGranted,
            "exception_denied" => LocalChangeStatus::ExceptionDenied,
            _ => return None,
        })
    }
}

/// Pending-change ledger row
///
/// Keyed by the `ref_id` of the report that opened it; `change_id` is filled
/// in when the controller acknowledges that report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalChange {
    pub ref_id: String,
    pub change_id: Option<String>,
    pub rule_id: String,
    pub file_path: String,
    pub enforcement_mode: EnforcementMode,
    pub original_hash: String,
    pub modified_hash: String,
    /// Full file content as the user left it
    pub modified_content: String,
    pub status: LocalChangeStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

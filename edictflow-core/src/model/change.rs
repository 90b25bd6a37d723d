//! Change requests and exception requests

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::rule::EnforcementMode;
use super::str_enum;

/// Status of a change request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    Pending,
    Approved,
    Rejected,
    AutoReverted,
    ExceptionGranted,
}

str_enum!(ChangeStatus {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
    AutoReverted => "auto_reverted",
    ExceptionGranted => "exception_granted",
});

impl ChangeStatus {
    /// Exceptions attach only to changes the system refused
    pub fn accepts_exception(&self) -> bool {
        matches!(self, ChangeStatus::Rejected | ChangeStatus::AutoReverted)
    }
}

/// An unsolicited modification of a managed section reported by an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub id: String,
    pub rule_id: String,
    pub agent_id: String,
    pub user_id: String,
    #[serde(default)]
    pub team_id: Option<String>,
    pub file_path: String,
    pub original_hash: String,
    pub modified_hash: String,
    pub diff: String,
    pub status: ChangeStatus,
    pub enforcement_mode: EnforcementMode,
    /// Set iff the enforcement mode is temporary
    #[serde(default)]
    pub timeout_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolved_by: Option<String>,
}

impl ChangeRequest {
    pub fn is_pending(&self) -> bool {
        self.status == ChangeStatus::Pending
    }

    /// Pending temporary change whose window has elapsed
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.is_pending()
            && self.enforcement_mode == EnforcementMode::Temporary
            && self.timeout_at.map(|t| t < now).unwrap_or(false)
    }
}

/// A drift report as it arrives from an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewChangeReport {
    pub rule_id: String,
    pub agent_id: String,
    pub user_id: String,
    #[serde(default)]
    pub team_id: Option<String>,
    pub file_path: String,
    pub original_hash: String,
    pub modified_hash: String,
    pub diff: String,
    pub enforcement_mode: EnforcementMode,
}

/// Whether an exception expires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionType {
    TimeLimited,
    Permanent,
}

str_enum!(ExceptionType {
    TimeLimited => "time_limited",
    Permanent => "permanent",
});

/// Status of an exception request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionStatus {
    Pending,
    Approved,
    Denied,
}

str_enum!(ExceptionStatus {
    Pending => "pending",
    Approved => "approved",
    Denied => "denied",
});

/// A user-initiated waiver attached to a rejected or auto-reverted change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionRequest {
    pub id: String,
    pub change_request_id: String,
    pub user_id: String,
    pub justification: String,
    pub exception_type: ExceptionType,
    /// Requested window for time-limited exceptions
    #[serde(default)]
    pub duration_hours: Option<u32>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub status: ExceptionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolved_by: Option<String>,
}

impl ExceptionRequest {
    /// Approved and not yet expired
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.status == ExceptionStatus::Approved
            && self.expires_at.map(|e| e > now).unwrap_or(true)
    }
}

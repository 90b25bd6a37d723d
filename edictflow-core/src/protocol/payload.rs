//! Payload schemas, one struct per message type
//!
//! Fields are permissive: unknown fields are ignored on decode and optional
//! additions default, so minor additions stay backward compatible.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{
    Category, EnforcementMode, ExceptionType, Rule, TargetLayer, Trigger,
};

// ═══════════════════════════════════════════════════════════════════════════
// Shared records
// ═══════════════════════════════════════════════════════════════════════════

/// The subset of a rule an agent needs to render and to match triggers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleRecord {
    pub id: String,
    pub name: String,
    pub body: String,
    pub target_layer: TargetLayer,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub enforcement_mode: EnforcementMode,
    #[serde(default)]
    pub temporary_timeout_hours: u32,
    #[serde(default)]
    pub priority_weight: i32,
    #[serde(default)]
    pub overridable: bool,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub effective_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub effective_end: Option<DateTime<Utc>>,
}

impl RuleRecord {
    pub fn is_effective_at(&self, now: DateTime<Utc>) -> bool {
        self.effective_start.map(|s| now >= s).unwrap_or(true)
            && self.effective_end.map(|e| now < e).unwrap_or(true)
    }

    pub fn matches_project(&self, project: &crate::model::ProjectContext) -> bool {
        self.triggers.is_empty() || self.triggers.iter().any(|t| t.matches(project))
    }
}

impl From<&Rule> for RuleRecord {
    fn from(rule: &Rule) -> Self {
        Self {
            id: rule.id.clone(),
            name: rule.name.clone(),
            body: rule.body.clone(),
            target_layer: rule.target_layer,
            triggers: rule.triggers.clone(),
            enforcement_mode: rule.enforcement_mode,
            temporary_timeout_hours: rule.temporary_timeout_hours,
            priority_weight: rule.priority_weight,
            overridable: rule.overridable,
            force: rule.force,
            category_id: rule.category_id.clone(),
            effective_start: rule.effective_start,
            effective_end: rule.effective_end,
        }
    }
}

/// Connection status an agent reports about itself
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Online,
    Stale,
    Offline,
}

// ═══════════════════════════════════════════════════════════════════════════
// Controller -> agent
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigUpdatePayload {
    pub rules: Vec<RuleRecord>,
    #[serde(default)]
    pub categories: Vec<Category>,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPayload {
    pub ref_id: String,
    /// Id of the entity the acknowledged message created or updated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    /// Error code when the controller refused the message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AckPayload {
    pub fn ok(ref_id: impl Into<String>) -> Self {
        Self {
            ref_id: ref_id.into(),
            entity_id: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeApprovedPayload {
    pub change_id: String,
    pub rule_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRejectedPayload {
    pub change_id: String,
    pub rule_id: String,
    pub revert_to_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    /// True when the sweeper reverted a timed-out temporary change
    #[serde(default)]
    pub auto_reverted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionGrantedPayload {
    pub exception_id: String,
    pub change_id: String,
    pub rule_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionDeniedPayload {
    pub exception_id: String,
    pub change_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequestPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Agent -> controller
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub status: AgentStatus,
    pub cached_version: u64,
    #[serde(default)]
    pub active_projects: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftEntry {
    pub file_path: String,
    pub expected_hash: String,
    pub actual_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftReportPayload {
    pub version: u64,
    pub checked: u32,
    #[serde(default)]
    pub drifted: Vec<DriftEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextDetectedPayload {
    pub project_path: String,
    #[serde(default)]
    pub context_types: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCompletePayload {
    pub version: u64,
    #[serde(default)]
    pub files_written: u32,
}

/// Shared by `change_detected` and `change_updated`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeDetectedPayload {
    pub rule_id: String,
    pub file_path: String,
    pub original_hash: String,
    pub modified_hash: String,
    #[serde(default)]
    pub diff: String,
    #[serde(default)]
    pub enforcement_mode: EnforcementMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionRequestPayload {
    pub change_id: String,
    pub justification: String,
    pub exception_type: ExceptionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_hours: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevertCompletePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_id: Option<String>,
    pub file_path: String,
    pub new_hash: String,
}

//! Approval records, approval configuration and team attachments

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::rule::TargetLayer;
use super::str_enum;

/// A single voter's decision on a pending rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
}

str_enum!(ApprovalDecision {
    Approved => "approved",
    Rejected => "rejected",
});

/// At most one record exists per (rule, voter)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub rule_id: String,
    pub voter_id: String,
    pub decision: ApprovalDecision,
    #[serde(default)]
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// How many holders of which permission must approve rules of a scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalConfig {
    pub scope: TargetLayer,
    pub permission: String,
    pub required_count: u32,
    /// Team-specific override; `None` is the global entry for the scope
    #[serde(default)]
    pub team_id: Option<String>,
}

impl ApprovalConfig {
    pub fn global(scope: TargetLayer, permission: impl Into<String>, required_count: u32) -> Self {
        Self {
            scope,
            permission: permission.into(),
            required_count,
            team_id: None,
        }
    }

    pub fn for_team(mut self, team_id: impl Into<String>) -> Self {
        self.team_id = Some(team_id.into());
        self
    }
}

/// Resolve the approval configuration for a rule of `scope` owned by `team`.
///
/// The team entry for the scope wins over the global entry, but an override
/// may only tighten: its required count never drops below the global one.
pub fn resolve_approval_config(
    configs: &[ApprovalConfig],
    scope: TargetLayer,
    team: Option<&str>,
) -> Option<ApprovalConfig> {
    let global = configs
        .iter()
        .find(|c| c.scope == scope && c.team_id.is_none());
    let team_entry = team.and_then(|team| {
        configs
            .iter()
            .find(|c| c.scope == scope && c.team_id.as_deref() == Some(team))
    });

    match (team_entry, global) {
        (Some(team_cfg), Some(global_cfg)) => {
            let mut resolved = team_cfg.clone();
            resolved.required_count = resolved.required_count.max(global_cfg.required_count);
            Some(resolved)
        }
        (Some(team_cfg), None) => Some(team_cfg.clone()),
        (None, Some(global_cfg)) => Some(global_cfg.clone()),
        (None, None) => None,
    }
}

/// Attachment status of a rule to a team
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentStatus {
    Pending,
    Approved,
}

str_enum!(AttachmentStatus {
    Pending => "pending",
    Approved => "approved",
});

/// Links a rule to a team that consumes it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleAttachment {
    pub rule_id: String,
    pub team_id: String,
    pub status: AttachmentStatus,
    pub requested_by: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configs() -> Vec<ApprovalConfig> {
        vec![
            ApprovalConfig::global(TargetLayer::Project, "rules.approve", 2),
            ApprovalConfig::global(TargetLayer::Project, "rules.approve.platform", 3)
                .for_team("platform"),
            ApprovalConfig::global(TargetLayer::Project, "rules.approve.web", 1).for_team("web"),
        ]
    }

    #[test]
    fn test_team_entry_wins() {
        let cfg = resolve_approval_config(&configs(), TargetLayer::Project, Some("platform")).unwrap();
        assert_eq!(cfg.permission, "rules.approve.platform");
        assert_eq!(cfg.required_count, 3);
    }

    #[test]
    fn test_override_cannot_loosen() {
        let cfg = resolve_approval_config(&configs(), TargetLayer::Project, Some("web")).unwrap();
        assert_eq!(cfg.permission, "rules.approve.web");
        assert_eq!(cfg.required_count, 2);
    }

    #[test]
    fn test_falls_back_to_global_entry() {
        let cfg = resolve_approval_config(&configs(), TargetLayer::Project, Some("mobile")).unwrap();
        assert_eq!(cfg.team_id, None);
        assert!(resolve_approval_config(&configs(), TargetLayer::Enterprise, None).is_none());
    }
}

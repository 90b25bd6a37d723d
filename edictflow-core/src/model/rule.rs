//! Rules and categories

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::str_enum;
use super::trigger::{ProjectContext, Trigger};
use crate::error::{EdictError, Result};

/// The layer of the managed file a rule renders into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetLayer {
    Enterprise,
    #[serde(alias = "global")]
    Organization,
    Project,
    Local,
}

str_enum!(TargetLayer {
    Enterprise => "enterprise",
    Organization => "organization",
    Project => "project",
    Local => "local",
});

impl TargetLayer {
    /// All layers, outermost first
    pub const ALL: [TargetLayer; 4] = [
        TargetLayer::Enterprise,
        TargetLayer::Organization,
        TargetLayer::Project,
        TargetLayer::Local,
    ];

    /// Enterprise and organization rules reach every team once approved
    pub fn is_global_scope(&self) -> bool {
        matches!(self, TargetLayer::Enterprise | TargetLayer::Organization)
    }
}

/// Lifecycle status of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    Draft,
    Pending,
    Approved,
    Rejected,
}

str_enum!(RuleStatus {
    Draft => "draft",
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
});

/// How the system reacts when the managed section drifts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementMode {
    /// Record only
    #[default]
    Advisory,
    /// Hold pending until resolved
    Block,
    /// Auto-revert after the rule's timeout window
    Temporary,
}

str_enum!(EnforcementMode {
    Advisory => "advisory",
    Block => "block",
    Temporary => "temporary",
});

impl EnforcementMode {
    /// Strictness used to pick one mode when several rules are involved
    pub fn strictness(&self) -> u8 {
        match self {
            EnforcementMode::Advisory => 0,
            EnforcementMode::Temporary => 1,
            EnforcementMode::Block => 2,
        }
    }
}

/// A unit of policy rendered into the managed section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    pub body: String,
    pub target_layer: TargetLayer,
    #[serde(default)]
    pub priority_weight: i32,
    #[serde(default)]
    pub overridable: bool,
    #[serde(default)]
    pub effective_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub effective_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub category_id: Option<String>,
    /// Owning team; `None` for global rules
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(default)]
    pub target_teams: Vec<String>,
    #[serde(default)]
    pub target_users: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    /// Enterprise-level mandatory
    #[serde(default)]
    pub force: bool,
    pub status: RuleStatus,
    #[serde(default)]
    pub enforcement_mode: EnforcementMode,
    #[serde(default)]
    pub temporary_timeout_hours: u32,
    pub created_by: String,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub approved_at: Option<DateTime<Utc>>,
    /// Voter whose vote moved the rule to approved or rejected
    #[serde(default)]
    pub resolved_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Rule {
    /// Whether the rule renders at `now` according to its effective window
    pub fn is_effective_at(&self, now: DateTime<Utc>) -> bool {
        if let Some(start) = self.effective_start {
            if now < start {
                return false;
            }
        }
        if let Some(end) = self.effective_end {
            if now >= end {
                return false;
            }
        }
        true
    }

    /// Maximum specificity across the rule's triggers (0 without triggers)
    pub fn specificity(&self) -> u32 {
        self.triggers.iter().map(Trigger::specificity).max().unwrap_or(0)
    }

    /// A rule without triggers applies everywhere; otherwise any trigger must match
    pub fn matches_project(&self, project: &ProjectContext) -> bool {
        self.triggers.is_empty() || self.triggers.iter().any(|t| t.matches(project))
    }

    /// Global rules have no owning team
    pub fn is_global(&self) -> bool {
        self.team_id.is_none()
    }

    pub fn is_team_wide(&self) -> bool {
        self.target_teams.is_empty() && self.target_users.is_empty()
    }
}

/// Input for creating a draft rule
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewRule {
    pub name: String,
    pub body: String,
    pub target_layer: Option<TargetLayer>,
    #[serde(default)]
    pub priority_weight: i32,
    #[serde(default)]
    pub overridable: bool,
    #[serde(default)]
    pub effective_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub effective_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(default)]
    pub target_teams: Vec<String>,
    #[serde(default)]
    pub target_users: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub enforcement_mode: EnforcementMode,
    #[serde(default)]
    pub temporary_timeout_hours: u32,
}

impl NewRule {
    pub fn new(name: impl Into<String>, body: impl Into<String>, layer: TargetLayer) -> Self {
        Self {
            name: name.into(),
            body: body.into(),
            target_layer: Some(layer),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(EdictError::validation("rule name must not be empty"));
        }
        if self.body.trim().is_empty() {
            return Err(EdictError::validation("rule body must not be empty"));
        }
        if self.target_layer.is_none() {
            return Err(EdictError::validation("rule target layer is required"));
        }
        validate_enforcement(self.enforcement_mode, self.temporary_timeout_hours)?;
        validate_window(self.effective_start, self.effective_end)
    }

    /// Materialize as a draft owned by `created_by`
    pub fn into_rule(self, id: String, created_by: &str, now: DateTime<Utc>) -> Result<Rule> {
        self.validate()?;
        Ok(Rule {
            id,
            name: self.name,
            body: self.body,
            target_layer: self.target_layer.unwrap_or(TargetLayer::Project),
            priority_weight: self.priority_weight,
            overridable: self.overridable,
            effective_start: self.effective_start,
            effective_end: self.effective_end,
            category_id: self.category_id,
            team_id: self.team_id,
            target_teams: self.target_teams,
            target_users: self.target_users,
            tags: self.tags,
            triggers: self.triggers,
            force: self.force,
            status: RuleStatus::Draft,
            enforcement_mode: self.enforcement_mode,
            temporary_timeout_hours: self.temporary_timeout_hours,
            created_by: created_by.to_string(),
            submitted_at: None,
            approved_at: None,
            resolved_by: None,
            created_at: now,
            updated_at: now,
        })
    }
}

/// Partial update applied to a draft rule
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulePatch {
    pub name: Option<String>,
    pub body: Option<String>,
    pub target_layer: Option<TargetLayer>,
    pub priority_weight: Option<i32>,
    pub overridable: Option<bool>,
    pub effective_start: Option<Option<DateTime<Utc>>>,
    pub effective_end: Option<Option<DateTime<Utc>>>,
    pub category_id: Option<Option<String>>,
    pub target_teams: Option<Vec<String>>,
    pub target_users: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
    pub triggers: Option<Vec<Trigger>>,
    pub force: Option<bool>,
    pub enforcement_mode: Option<EnforcementMode>,
    pub temporary_timeout_hours: Option<u32>,
}

impl RulePatch {
    pub fn apply(self, rule: &mut Rule, now: DateTime<Utc>) -> Result<()> {
        let mut next = rule.clone();
        if let Some(v) = self.name {
            next.name = v;
        }
        if let Some(v) = self.body {
            next.body = v;
        }
        if let Some(v) = self.target_layer {
            next.target_layer = v;
        }
        if let Some(v) = self.priority_weight {
            next.priority_weight = v;
        }
        if let Some(v) = self.overridable {
            next.overridable = v;
        }
        if let Some(v) = self.effective_start {
            next.effective_start = v;
        }
        if let Some(v) = self.effective_end {
            next.effective_end = v;
        }
        if let Some(v) = self.category_id {
            next.category_id = v;
        }
        if let Some(v) = self.target_teams {
            next.target_teams = v;
        }
        if let Some(v) = self.target_users {
            next.target_users = v;
        }
        if let Some(v) = self.tags {
            next.tags = v;
        }
        if let Some(v) = self.triggers {
            next.triggers = v;
        }
        if let Some(v) = self.force {
            next.force = v;
        }
        if let Some(v) = self.enforcement_mode {
            next.enforcement_mode = v;
        }
        if let Some(v) = self.temporary_timeout_hours {
            next.temporary_timeout_hours = v;
        }

        if next.name.trim().is_empty() {
            return Err(EdictError::validation("rule name must not be empty"));
        }
        if next.body.trim().is_empty() {
            return Err(EdictError::validation("rule body must not be empty"));
        }
        validate_enforcement(next.enforcement_mode, next.temporary_timeout_hours)?;
        validate_window(next.effective_start, next.effective_end)?;

        next.updated_at = now;
        *rule = next;
        Ok(())
    }
}

fn validate_enforcement(mode: EnforcementMode, timeout_hours: u32) -> Result<()> {
    if mode == EnforcementMode::Temporary && timeout_hours == 0 {
        return Err(EdictError::validation(
            "temporary enforcement requires temporary_timeout_hours > 0",
        ));
    }
    Ok(())
}

fn validate_window(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Result<()> {
    if let (Some(start), Some(end)) = (start, end) {
        if end <= start {
            return Err(EdictError::validation("effective window ends before it starts"));
        }
    }
    Ok(())
}

/// Grouping used when rendering the managed section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub display_order: i32,
}

impl Category {
    pub fn new(id: impl Into<String>, name: impl Into<String>, display_order: i32) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            display_order,
        }
    }
}

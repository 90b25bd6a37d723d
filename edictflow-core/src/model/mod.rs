//! Domain model shared by the controller and the agent
//!
//! Entities reference each other by id only. Traversals between rules,
//! change requests and exceptions are lookups through a store, never object
//! graphs held across handlers.

/// Generates `as_str`, `Display` and `FromStr` for a fieldless enum whose
/// serde representation uses the same strings.
macro_rules! str_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            /// Wire and storage representation
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $ty {
            type Err = $crate::error::EdictError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err($crate::error::EdictError::validation(format!(
                        "unknown {} '{}'",
                        stringify!($ty),
                        other
                    ))),
                }
            }
        }
    };
}

pub(crate) use str_enum;

mod approval;
mod change;
mod rule;
mod trigger;

pub use approval::{
    resolve_approval_config, ApprovalConfig, ApprovalDecision, ApprovalRecord,
    AttachmentStatus, RuleAttachment,
};
pub use change::{
    ChangeRequest, ChangeStatus, ExceptionRequest, ExceptionStatus, ExceptionType,
    NewChangeReport,
};
pub use rule::{Category, NewRule, Rule, RulePatch, RuleStatus, TargetLayer, EnforcementMode};
pub use trigger::{ProjectContext, Trigger};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The identity an effective rule set is resolved for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    /// User the agent runs as
    pub user_id: String,

    /// Teams the user belongs to
    #[serde(default)]
    pub team_ids: Vec<String>,

    /// Whether the user's team inherits non-forced global rules
    #[serde(default)]
    pub inherits_global: bool,
}

impl Caller {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            team_ids: Vec::new(),
            inherits_global: false,
        }
    }

    pub fn with_teams(mut self, team_ids: Vec<String>) -> Self {
        self.team_ids = team_ids;
        self
    }

    pub fn inheriting_global(mut self, inherits: bool) -> Self {
        self.inherits_global = inherits;
        self
    }

    /// Stable key identifying every caller that resolves to the same rule set
    pub fn cohort_key(&self) -> String {
        let mut teams = self.team_ids.clone();
        teams.sort();
        teams.dedup();
        format!(
            "{}|{}|{}",
            self.user_id,
            teams.join(","),
            if self.inherits_global { "inherit" } else { "isolated" }
        )
    }
}

/// An agent known to the controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub user_id: String,
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl AgentRecord {
    pub fn new(agent_id: impl Into<String>, user_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            agent_id: agent_id.into(),
            user_id: user_id.into(),
            team_id: None,
            hostname: None,
            registered_at: now,
            last_seen_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cohort_key_ignores_team_order() {
        let a = Caller::new("u1").with_teams(vec!["b".into(), "a".into()]);
        let b = Caller::new("u1").with_teams(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(a.cohort_key(), b.cohort_key());
        assert_ne!(a.cohort_key(), a.clone().inheriting_global(true).cohort_key());
    }
}

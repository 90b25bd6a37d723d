//! Team membership and permission lookups
//!
//! Membership and permissions are owned elsewhere; the controller only reads
//! them through [`Directory`] and [`PermissionOracle`]. [`StaticDirectory`]
//! implements both from a JSON document, which is what the server loads at
//! startup and what tests build inline.
//!
//! ```rust
//! use edictflow_core::directory::{Directory, PermissionOracle, StaticDirectory, Team};
//!
//! let dir = StaticDirectory::new()
//!     .with_team(Team::new("platform").inheriting_global())
//!     .with_member("alice", "platform")
//!     .with_permission("alice", "rules.approve");
//!
//! assert!(dir.has_permission("alice", "rules.approve"));
//! assert!(dir.caller_for("alice").inherits_global);
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EdictError, Result};
use crate::model::Caller;

/// Permission codes the controller checks
pub mod permissions {
    /// Default permission for rule approval votes
    pub const RULES_APPROVE: &str = "rules.approve";
    /// Approve or reject change requests
    pub const CHANGES_RESOLVE: &str = "changes.resolve";
    /// Approve or deny exception requests
    pub const EXCEPTIONS_RESOLVE: &str = "exceptions.resolve";
}

/// A team as the directory describes it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Members receive non-forced global rules
    #[serde(default)]
    pub inherits_global: bool,
}

impl Team {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            inherits_global: false,
        }
    }

    pub fn inheriting_global(mut self) -> Self {
        self.inherits_global = true;
        self
    }
}

/// Read-only view of teams and memberships
pub trait Directory: Send + Sync {
    fn teams(&self) -> Vec<Team>;

    fn team(&self, team_id: &str) -> Option<Team>;

    /// Teams `user_id` belongs to
    fn user_teams(&self, user_id: &str) -> Vec<String>;

    /// The caller identity used to resolve `user_id`'s effective rules
    fn caller_for(&self, user_id: &str) -> Caller {
        let team_ids = self.user_teams(user_id);
        let inherits = team_ids
            .iter()
            .filter_map(|t| self.team(t))
            .any(|t| t.inherits_global);
        Caller::new(user_id)
            .with_teams(team_ids)
            .inheriting_global(inherits)
    }
}

/// Answers whether a user holds a permission code
pub trait PermissionOracle: Send + Sync {
    fn has_permission(&self, user_id: &str, permission: &str) -> bool;
}

/// Directory and permission oracle backed by a fixed document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticDirectory {
    #[serde(default)]
    teams: Vec<Team>,
    /// user -> team ids
    #[serde(default)]
    members: BTreeMap<String, BTreeSet<String>>,
    /// user -> permission codes
    #[serde(default)]
    permissions: BTreeMap<String, BTreeSet<String>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON file with `teams`, `members` and `permissions`
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| EdictError::Io {
            message: format!("failed to read directory {}: {}", path.display(), e),
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn with_team(mut self, team: Team) -> Self {
        self.teams.retain(|t| t.id != team.id);
        self.teams.push(team);
        self
    }

    pub fn with_member(mut self, user_id: &str, team_id: &str) -> Self {
        self.members
            .entry(user_id.to_string())
            .or_default()
            .insert(team_id.to_string());
        self
    }

    pub fn with_permission(mut self, user_id: &str, permission: &str) -> Self {
        self.permissions
            .entry(user_id.to_string())
            .or_default()
            .insert(permission.to_string());
        self
    }
}

impl Directory for StaticDirectory {
    fn teams(&self) -> Vec<Team> {
        self.teams.clone()
    }

    fn team(&self, team_id: &str) -> Option<Team> {
        self.teams.iter().find(|t| t.id == team_id).cloned()
    }

    fn user_teams(&self, user_id: &str) -> Vec<String> {
        self.members
            .get(user_id)
            .map(|teams| teams.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl PermissionOracle for StaticDirectory {
    fn has_permission(&self, user_id: &str, permission: &str) -> bool {
        self.permissions
            .get(user_id)
            .map(|perms| perms.contains(permission) || perms.contains("*"))
            .unwrap_or(false)
    }
}

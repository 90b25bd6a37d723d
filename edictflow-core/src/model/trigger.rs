//! Triggers decide whether a rule applies to a project

use glob::Pattern;
use serde::{Deserialize, Serialize};

/// Specificity weight of a path trigger
pub const PATH_SPECIFICITY: u32 = 100;
/// Specificity weight of a context-type trigger
pub const CONTEXT_SPECIFICITY: u32 = 50;
/// Specificity weight of a tag trigger
pub const TAG_SPECIFICITY: u32 = 10;

/// When a rule applies to a project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Glob over the project path
    Path { pattern: String },
    /// Any of the detected context types
    Context { types: Vec<String> },
    /// Any of the project's tags
    Tag { tags: Vec<String> },
}

impl Trigger {
    pub fn specificity(&self) -> u32 {
        match self {
            Trigger::Path { .. } => PATH_SPECIFICITY,
            Trigger::Context { .. } => CONTEXT_SPECIFICITY,
            Trigger::Tag { .. } => TAG_SPECIFICITY,
        }
    }

    pub fn matches(&self, project: &ProjectContext) -> bool {
        match self {
            Trigger::Path { pattern } => match Pattern::new(pattern) {
                Ok(glob) => glob.matches(&project.path),
                Err(_) => {
                    tracing::debug!(pattern = %pattern, "ignoring invalid path trigger");
                    false
                }
            },
            Trigger::Context { types } => intersects(types, &project.context_types),
            Trigger::Tag { tags } => intersects(tags, &project.tags),
        }
    }
}

fn intersects(wanted: &[String], have: &[String]) -> bool {
    wanted
        .iter()
        .any(|w| have.iter().any(|h| h.eq_ignore_ascii_case(w)))
}

/// What the agent knows about a watched project
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectContext {
    pub path: String,
    #[serde(default)]
    pub context_types: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ProjectContext {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }
}

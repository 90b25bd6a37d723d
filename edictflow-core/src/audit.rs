//! Append-only audit trail of lifecycle transitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Entity kinds that appear in the audit trail
pub mod entity {
    pub const RULE: &str = "rule";
    pub const ATTACHMENT: &str = "attachment";
    pub const CHANGE: &str = "change_request";
    pub const EXCEPTION: &str = "exception_request";
    pub const CATEGORY: &str = "category";
}

/// One recorded transition, vote or decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub action: String,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub details: Value,
}

impl AuditEvent {
    pub fn new(
        entity_type: &str,
        entity_id: impl Into<String>,
        action: &str,
        actor: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.into(),
            action: action.to_string(),
            actor: actor.into(),
            timestamp,
            details: Value::Null,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

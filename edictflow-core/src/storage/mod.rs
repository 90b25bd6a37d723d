//! Pluggable controller storage
//!
//! The controller's durable state lives behind [`ControllerStore`]. Two
//! backends ship with the crate:
//!
//! - [`InMemoryStore`]: default, lost on restart, used by tests
//! - [`SqliteStore`]: one SQLite file (feature `sqlite`)
//!
//! Backends serialize their own concurrent access; callers never hold a
//! store lock across I/O of their own. Uniqueness invariants are enforced
//! here, not only by callers:
//!
//! - one approval record per (rule, voter): [`EdictError::DuplicateVote`]
//! - one attachment per (rule, team): [`EdictError::DuplicateAttachment`]
//! - one pending change request per (agent, file): [`EdictError::AlreadyExists`]
//!
//! # Example
//!
//! ```rust
//! use edictflow_core::storage::{ControllerStore, InMemoryStore};
//!
//! let store = InMemoryStore::new();
//! assert!(store.health_check().is_ok());
//! assert!(store.list_rules().unwrap().is_empty());
//! ```

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::InMemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use crate::audit::AuditEvent;
use crate::error::Result;
use crate::model::{
    AgentRecord, ApprovalConfig, ApprovalRecord, AttachmentStatus, Category, ChangeRequest,
    ChangeStatus, ExceptionRequest, Rule, RuleAttachment,
};

/// Storage backend for all cross-agent controller state
///
/// All methods take `&self`; implementations use interior mutability.
pub trait ControllerStore: Send + Sync {
    // Rules
    fn insert_rule(&self, rule: &Rule) -> Result<()>;
    /// Fails with `RuleNotFound` when the rule is absent
    fn update_rule(&self, rule: &Rule) -> Result<()>;
    /// Removes the rule together with its approvals and attachments
    fn delete_rule(&self, rule_id: &str) -> Result<()>;
    fn get_rule(&self, rule_id: &str) -> Result<Option<Rule>>;
    fn list_rules(&self) -> Result<Vec<Rule>>;

    // Approvals
    fn insert_approval(&self, record: &ApprovalRecord) -> Result<()>;
    /// Records in insertion order
    fn list_approvals(&self, rule_id: &str) -> Result<Vec<ApprovalRecord>>;
    fn clear_approvals(&self, rule_id: &str) -> Result<()>;

    // Approval configuration
    fn upsert_approval_config(&self, config: &ApprovalConfig) -> Result<()>;
    fn list_approval_configs(&self) -> Result<Vec<ApprovalConfig>>;

    // Attachments
    fn insert_attachment(&self, attachment: &RuleAttachment) -> Result<()>;
    fn set_attachment_status(
        &self,
        rule_id: &str,
        team_id: &str,
        status: AttachmentStatus,
    ) -> Result<()>;
    fn list_attachments(&self, rule_id: &str) -> Result<Vec<RuleAttachment>>;

    // Categories
    fn upsert_category(&self, category: &Category) -> Result<()>;
    fn list_categories(&self) -> Result<Vec<Category>>;

    // Agents
    fn upsert_agent(&self, agent: &AgentRecord) -> Result<()>;
    fn get_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>>;
    fn list_agents(&self) -> Result<Vec<AgentRecord>>;

    // Change requests
    fn insert_change(&self, change: &ChangeRequest) -> Result<()>;
    fn update_change(&self, change: &ChangeRequest) -> Result<()>;
    fn get_change(&self, change_id: &str) -> Result<Option<ChangeRequest>>;
    fn find_pending_change(&self, agent_id: &str, file_path: &str)
        -> Result<Option<ChangeRequest>>;
    /// Oldest first; `None` lists every status
    fn list_changes(&self, status: Option<ChangeStatus>) -> Result<Vec<ChangeRequest>>;

    // Exception requests
    fn insert_exception(&self, exception: &ExceptionRequest) -> Result<()>;
    fn update_exception(&self, exception: &ExceptionRequest) -> Result<()>;
    fn get_exception(&self, exception_id: &str) -> Result<Option<ExceptionRequest>>;
    /// Oldest first
    fn list_exceptions(&self) -> Result<Vec<ExceptionRequest>>;

    // Audit
    fn append_audit(&self, event: &AuditEvent) -> Result<()>;
    /// Events for `entity_id` in insertion order
    fn audit_trail(&self, entity_id: &str) -> Result<Vec<AuditEvent>>;

    // Config versions
    /// Highest config version recorded, 0 for a fresh store
    fn latest_version(&self) -> Result<u64>;
    /// Record `version` as handed out; never lowers the stored value
    fn record_version(&self, version: u64) -> Result<()>;

    /// Check if backend is healthy
    fn health_check(&self) -> Result<()>;

    /// Backend name for logging
    fn name(&self) -> &'static str;
}

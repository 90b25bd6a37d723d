//! In-memory controller store

use parking_lot::RwLock;

use super::ControllerStore;
use crate::audit::AuditEvent;
use crate::error::{EdictError, Result};
use crate::model::{
    AgentRecord, ApprovalConfig, ApprovalRecord, AttachmentStatus, Category, ChangeRequest,
    ChangeStatus, ExceptionRequest, Rule, RuleAttachment,
};

#[derive(Debug, Default)]
struct State {
    rules: Vec<Rule>,
    approvals: Vec<ApprovalRecord>,
    approval_configs: Vec<ApprovalConfig>,
    attachments: Vec<RuleAttachment>,
    categories: Vec<Category>,
    agents: Vec<AgentRecord>,
    changes: Vec<ChangeRequest>,
    exceptions: Vec<ExceptionRequest>,
    audit: Vec<AuditEvent>,
    latest_version: u64,
}

/// In-memory storage backend (default)
///
/// Everything is lost on restart. Thread-safe via a single `RwLock`, so each
/// call is atomic with respect to every other call.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of audit events recorded so far
    pub fn audit_len(&self) -> usize {
        self.state.read().audit.len()
    }
}

impl ControllerStore for InMemoryStore {
    fn insert_rule(&self, rule: &Rule) -> Result<()> {
        let mut state = self.state.write();
        if state.rules.iter().any(|r| r.id == rule.id) {
            return Err(EdictError::AlreadyExists {
                entity: "rule",
                id: rule.id.clone(),
            });
        }
        state.rules.push(rule.clone());
        Ok(())
    }

    fn update_rule(&self, rule: &Rule) -> Result<()> {
        let mut state = self.state.write();
        let slot = state
            .rules
            .iter_mut()
            .find(|r| r.id == rule.id)
            .ok_or_else(|| EdictError::RuleNotFound {
                rule_id: rule.id.clone(),
            })?;
        *slot = rule.clone();
        Ok(())
    }

    fn delete_rule(&self, rule_id: &str) -> Result<()> {
        let mut state = self.state.write();
        state.rules.retain(|r| r.id != rule_id);
        state.approvals.retain(|a| a.rule_id != rule_id);
        state.attachments.retain(|a| a.rule_id != rule_id);
        Ok(())
    }

    fn get_rule(&self, rule_id: &str) -> Result<Option<Rule>> {
        Ok(self.state.read().rules.iter().find(|r| r.id == rule_id).cloned())
    }

    fn list_rules(&self) -> Result<Vec<Rule>> {
        Ok(self.state.read().rules.clone())
    }

    fn insert_approval(&self, record: &ApprovalRecord) -> Result<()> {
        let mut state = self.state.write();
        if state
            .approvals
            .iter()
            .any(|a| a.rule_id == record.rule_id && a.voter_id == record.voter_id)
        {
            return Err(EdictError::DuplicateVote {
                rule_id: record.rule_id.clone(),
                voter_id: record.voter_id.clone(),
            });
        }
        state.approvals.push(record.clone());
        Ok(())
    }

    fn list_approvals(&self, rule_id: &str) -> Result<Vec<ApprovalRecord>> {
        Ok(self
            .state
            .read()
            .approvals
            .iter()
            .filter(|a| a.rule_id == rule_id)
            .cloned()
            .collect())
    }

    fn clear_approvals(&self, rule_id: &str) -> Result<()> {
        self.state.write().approvals.retain(|a| a.rule_id != rule_id);
        Ok(())
    }

    fn upsert_approval_config(&self, config: &ApprovalConfig) -> Result<()> {
        let mut state = self.state.write();
        state
            .approval_configs
            .retain(|c| !(c.scope == config.scope && c.team_id == config.team_id));
        state.approval_configs.push(config.clone());
        Ok(())
    }

    fn list_approval_configs(&self) -> Result<Vec<ApprovalConfig>> {
        Ok(self.state.read().approval_configs.clone())
    }

    fn insert_attachment(&self, attachment: &RuleAttachment) -> Result<()> {
        let mut state = self.state.write();
        if state
            .attachments
            .iter()
            .any(|a| a.rule_id == attachment.rule_id && a.team_id == attachment.team_id)
        {
            return Err(EdictError::DuplicateAttachment {
                rule_id: attachment.rule_id.clone(),
                team_id: attachment.team_id.clone(),
            });
        }
        state.attachments.push(attachment.clone());
        Ok(())
    }

    fn set_attachment_status(
        &self,
        rule_id: &str,
        team_id: &str,
        status: AttachmentStatus,
    ) -> Result<()> {
        let mut state = self.state.write();
        let slot = state
            .attachments
            .iter_mut()
            .find(|a| a.rule_id == rule_id && a.team_id == team_id)
            .ok_or_else(|| EdictError::TeamNotFound {
                team_id: team_id.to_string(),
            })?;
        slot.status = status;
        Ok(())
    }

    fn list_attachments(&self, rule_id: &str) -> Result<Vec<RuleAttachment>> {
        Ok(self
            .state
            .read()
            .attachments
            .iter()
            .filter(|a| a.rule_id == rule_id)
            .cloned()
            .collect())
    }

    fn upsert_category(&self, category: &Category) -> Result<()> {
        let mut state = self.state.write();
        match state.categories.iter_mut().find(|c| c.id == category.id) {
            Some(slot) => *slot = category.clone(),
            None => state.categories.push(category.clone()),
        }
        Ok(())
    }

    fn list_categories(&self) -> Result<Vec<Category>> {
        Ok(self.state.read().categories.clone())
    }

    fn upsert_agent(&self, agent: &AgentRecord) -> Result<()> {
        let mut state = self.state.write();
        match state.agents.iter_mut().find(|a| a.agent_id == agent.agent_id) {
            Some(slot) => {
                let registered_at = slot.registered_at;
                *slot = agent.clone();
                slot.registered_at = registered_at;
            }
            None => state.agents.push(agent.clone()),
        }
        Ok(())
    }

    fn get_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>> {
        Ok(self
            .state
            .read()
            .agents
            .iter()
            .find(|a| a.agent_id == agent_id)
            .cloned())
    }

    fn list_agents(&self) -> Result<Vec<AgentRecord>> {
        Ok(self.state.read().agents.clone())
    }

    fn insert_change(&self, change: &ChangeRequest) -> Result<()> {
        let mut state = self.state.write();
        if change.is_pending()
            && state.changes.iter().any(|c| {
                c.is_pending() && c.agent_id == change.agent_id && c.file_path == change.file_path
            })
        {
            return Err(EdictError::AlreadyExists {
                entity: "pending change request",
                id: format!("{}:{}", change.agent_id, change.file_path),
            });
        }
        state.changes.push(change.clone());
        Ok(())
    }

    fn update_change(&self, change: &ChangeRequest) -> Result<()> {
        let mut state = self.state.write();
        let slot = state
            .changes
            .iter_mut()
            .find(|c| c.id == change.id)
            .ok_or_else(|| EdictError::ChangeNotFound {
                change_id: change.id.clone(),
            })?;
        *slot = change.clone();
        Ok(())
    }

    fn get_change(&self, change_id: &str) -> Result<Option<ChangeRequest>> {
        Ok(self
            .state
            .read()
            .changes
            .iter()
            .find(|c| c.id == change_id)
            .cloned())
    }

    fn find_pending_change(
        &self,
        agent_id: &str,
        file_path: &str,
    ) -> Result<Option<ChangeRequest>> {
        Ok(self
            .state
            .read()
            .changes
            .iter()
            .find(|c| c.is_pending() && c.agent_id == agent_id && c.file_path == file_path)
            .cloned())
    }

    fn list_changes(&self, status: Option<ChangeStatus>) -> Result<Vec<ChangeRequest>> {
        Ok(self
            .state
            .read()
            .changes
            .iter()
            .filter(|c| status.map(|s| c.status == s).unwrap_or(true))
            .cloned()
            .collect())
    }

    fn insert_exception(&self, exception: &ExceptionRequest) -> Result<()> {
        let mut state = self.state.write();
        if state.exceptions.iter().any(|e| e.id == exception.id) {
            return Err(EdictError::AlreadyExists {
                entity: "exception request",
                id: exception.id.clone(),
            });
        }
        state.exceptions.push(exception.clone());
        Ok(())
    }

    fn update_exception(&self, exception: &ExceptionRequest) -> Result<()> {
        let mut state = self.state.write();
        let slot = state
            .exceptions
            .iter_mut()
            .find(|e| e.id == exception.id)
            .ok_or_else(|| EdictError::ExceptionNotFound {
                exception_id: exception.id.clone(),
            })?;
        *slot = exception.clone();
        Ok(())
    }

    fn get_exception(&self, exception_id: &str) -> Result<Option<ExceptionRequest>> {
        Ok(self
            .state
            .read()
            .exceptions
            .iter()
            .find(|e| e.id == exception_id)
            .cloned())
    }

    fn list_exceptions(&self) -> Result<Vec<ExceptionRequest>> {
        Ok(self.state.read().exceptions.clone())
    }

    fn append_audit(&self, event: &AuditEvent) -> Result<()> {
        self.state.write().audit.push(event.clone());
        Ok(())
    }

    fn audit_trail(&self, entity_id: &str) -> Result<Vec<AuditEvent>> {
        Ok(self
            .state
            .read()
            .audit
            .iter()
            .filter(|e| e.entity_id == entity_id)
            .cloned()
            .collect())
    }

    fn latest_version(&self) -> Result<u64> {
        Ok(self.state.read().latest_version)
    }

    fn record_version(&self, version: u64) -> Result<()> {
        let mut state = self.state.write();
        state.latest_version = state.latest_version.max(version);
        Ok(())
    }

    fn health_check(&self) -> Result<()> {
        let _state = self.state.read();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "in-memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::contract;

    #[test]
    fn test_rules_round_trip() {
        contract::rules_round_trip(&InMemoryStore::new());
    }

    #[test]
    fn test_approvals_are_unique_and_ordered() {
        contract::approvals_are_unique_and_ordered(&InMemoryStore::new());
    }

    #[test]
    fn test_one_pending_change_per_agent_file() {
        contract::one_pending_change_per_agent_file(&InMemoryStore::new());
    }

    #[test]
    fn test_attachments_are_unique() {
        contract::attachments_are_unique(&InMemoryStore::new());
    }

    #[test]
    fn test_version_never_decreases() {
        contract::version_never_decreases(&InMemoryStore::new());
    }

    #[test]
    fn test_audit_trail_in_order() {
        let store = InMemoryStore::new();
        contract::audit_trail_in_order(&store);
        assert_eq!(store.audit_len(), 4);
    }
}

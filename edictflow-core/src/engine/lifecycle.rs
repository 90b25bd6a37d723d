//! Rule lifecycle and approval engine
//!
//! ```text
//! DRAFT --submit--> PENDING --enough approvals--> APPROVED
//!                   PENDING --any rejection-----> REJECTED --resubmit--> PENDING
//! APPROVED | PENDING --reset--> DRAFT
//! ```
//!
//! Every transition of one rule runs under that rule's lock, so concurrent
//! votes see a monotone approval count. Transitions that change the approved
//! set trigger a config broadcast.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::audit::{entity, AuditEvent};
use crate::clock::Clock;
use crate::directory::{permissions, Directory, PermissionOracle};
use crate::error::{EdictError, Result};
use crate::model::{
    resolve_approval_config, ApprovalConfig, ApprovalDecision, ApprovalRecord, AttachmentStatus,
    Category, NewRule, Rule, RuleAttachment, RulePatch, RuleStatus, TargetLayer,
};
use crate::storage::ControllerStore;

use super::distribution::Distributor;

/// Per-rule critical sections
#[derive(Debug, Default)]
pub(crate) struct RuleLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RuleLocks {
    pub(crate) fn handle(&self, rule_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(rule_id.to_string())
            .or_default()
            .clone()
    }

    fn forget(&self, rule_id: &str) {
        self.locks.lock().remove(rule_id);
    }
}

/// Result of a transition, with the status the rule left
#[derive(Debug, Clone, Serialize)]
pub struct Transition {
    pub rule: Rule,
    pub previous: RuleStatus,
}

/// Result of an approval vote
#[derive(Debug, Clone, Serialize)]
pub struct VoteOutcome {
    pub rule: Rule,
    /// Approved records stored for the rule after this vote
    pub approvals: u32,
    pub required: u32,
    /// This vote moved the rule to APPROVED
    pub promoted: bool,
    /// Teams auto-attached because of the promotion
    pub attached_teams: Vec<String>,
}

/// Filter for [`RuleEngine::list`]
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleFilter {
    pub status: Option<RuleStatus>,
    pub layer: Option<TargetLayer>,
    pub team_id: Option<String>,
}

/// Rule catalog, lifecycle transitions and approval accounting
pub struct RuleEngine {
    store: Arc<dyn ControllerStore>,
    directory: Arc<dyn Directory>,
    oracle: Arc<dyn PermissionOracle>,
    clock: Arc<dyn Clock>,
    distributor: Arc<Distributor>,
    locks: RuleLocks,
}

impl RuleEngine {
    pub fn new(
        store: Arc<dyn ControllerStore>,
        directory: Arc<dyn Directory>,
        oracle: Arc<dyn PermissionOracle>,
        clock: Arc<dyn Clock>,
        distributor: Arc<Distributor>,
    ) -> Self {
        Self {
            store,
            directory,
            oracle,
            clock,
            distributor,
            locks: RuleLocks::default(),
        }
    }

    fn audit(&self, entity_type: &str, entity_id: &str, action: &str, actor: &str) -> AuditEvent {
        AuditEvent::new(entity_type, entity_id, action, actor, self.clock.now())
    }

    fn load(&self, rule_id: &str) -> Result<Rule> {
        self.store
            .get_rule(rule_id)?
            .ok_or_else(|| EdictError::RuleNotFound {
                rule_id: rule_id.to_string(),
            })
    }

    fn invalid(rule: &Rule, action: &'static str) -> EdictError {
        EdictError::InvalidState {
            entity: "rule",
            id: rule.id.clone(),
            status: rule.status.to_string(),
            action,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Catalog
    // ═══════════════════════════════════════════════════════════════════════

    /// Create a draft rule
    pub fn create(&self, input: NewRule, created_by: &str) -> Result<Rule> {
        if let Some(team_id) = &input.team_id {
            if self.directory.team(team_id).is_none() {
                return Err(EdictError::TeamNotFound {
                    team_id: team_id.clone(),
                });
            }
        }
        let rule = input.into_rule(Uuid::new_v4().to_string(), created_by, self.clock.now())?;
        self.store.insert_rule(&rule)?;
        self.store.append_audit(
            &self
                .audit(entity::RULE, &rule.id, "created", created_by)
                .with_details(json!({ "name": rule.name, "layer": rule.target_layer })),
        )?;
        tracing::info!(rule_id = %rule.id, name = %rule.name, "rule created");
        Ok(rule)
    }

    /// Edit a draft rule
    pub fn update(&self, rule_id: &str, patch: RulePatch, actor: &str) -> Result<Rule> {
        let handle = self.locks.handle(rule_id);
        let _guard = handle.lock();

        let mut rule = self.load(rule_id)?;
        if rule.status != RuleStatus::Draft {
            return Err(Self::invalid(&rule, "edit"));
        }
        patch.apply(&mut rule, self.clock.now())?;
        self.store.update_rule(&rule)?;
        self.store
            .append_audit(&self.audit(entity::RULE, rule_id, "updated", actor))?;
        Ok(rule)
    }

    /// Delete a draft rule with its approval records
    pub fn delete(&self, rule_id: &str, actor: &str) -> Result<()> {
        {
            let handle = self.locks.handle(rule_id);
            let _guard = handle.lock();

            let rule = self.load(rule_id)?;
            if rule.status != RuleStatus::Draft {
                return Err(Self::invalid(&rule, "delete"));
            }
            self.store.delete_rule(rule_id)?;
            self.store
                .append_audit(&self.audit(entity::RULE, rule_id, "deleted", actor))?;
        }
        self.locks.forget(rule_id);
        tracing::info!(rule_id = %rule_id, "rule deleted");
        Ok(())
    }

    pub fn get(&self, rule_id: &str) -> Result<Rule> {
        self.load(rule_id)
    }

    pub fn list(&self, filter: &RuleFilter) -> Result<Vec<Rule>> {
        Ok(self
            .store
            .list_rules()?
            .into_iter()
            .filter(|r| filter.status.map(|s| r.status == s).unwrap_or(true))
            .filter(|r| filter.layer.map(|l| r.target_layer == l).unwrap_or(true))
            .filter(|r| {
                filter
                    .team_id
                    .as_ref()
                    .map(|t| r.team_id.as_ref() == Some(t))
                    .unwrap_or(true)
            })
            .collect())
    }

    /// Approval records in insertion order
    pub fn approvals(&self, rule_id: &str) -> Result<Vec<ApprovalRecord>> {
        self.load(rule_id)?;
        self.store.list_approvals(rule_id)
    }

    pub fn upsert_category(&self, category: Category, actor: &str) -> Result<Category> {
        if category.name.trim().is_empty() {
            return Err(EdictError::validation("category name must not be empty"));
        }
        self.store.upsert_category(&category)?;
        self.store
            .append_audit(&self.audit(entity::CATEGORY, &category.id, "upserted", actor))?;
        Ok(category)
    }

    pub fn categories(&self) -> Result<Vec<Category>> {
        self.store.list_categories()
    }

    pub fn set_approval_config(&self, config: ApprovalConfig) -> Result<()> {
        if config.required_count == 0 {
            return Err(EdictError::validation("required approval count must be at least 1"));
        }
        self.store.upsert_approval_config(&config)
    }

    /// The approval configuration that governs `rule`
    ///
    /// Without any configured entry a single holder of `rules.approve` suffices.
    pub fn approval_config_for(&self, rule: &Rule) -> Result<ApprovalConfig> {
        let configs = self.store.list_approval_configs()?;
        Ok(
            resolve_approval_config(&configs, rule.target_layer, rule.team_id.as_deref())
                .unwrap_or_else(|| {
                    ApprovalConfig::global(rule.target_layer, permissions::RULES_APPROVE, 1)
                }),
        )
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    /// DRAFT -> PENDING
    pub fn submit(&self, rule_id: &str, actor: &str) -> Result<Transition> {
        let handle = self.locks.handle(rule_id);
        let _guard = handle.lock();

        let mut rule = self.load(rule_id)?;
        if rule.status != RuleStatus::Draft {
            return Err(Self::invalid(&rule, "submit"));
        }
        let previous = rule.status;
        let now = self.clock.now();
        rule.status = RuleStatus::Pending;
        rule.submitted_at = Some(now);
        rule.resolved_by = None;
        rule.updated_at = now;
        self.store.update_rule(&rule)?;
        self.store
            .append_audit(&self.audit(entity::RULE, rule_id, "submitted", actor))?;
        tracing::info!(rule_id = %rule_id, "rule submitted for approval");
        Ok(Transition { rule, previous })
    }

    /// REJECTED -> PENDING, starting a fresh approval round
    pub fn resubmit(&self, rule_id: &str, actor: &str) -> Result<Transition> {
        let handle = self.locks.handle(rule_id);
        let _guard = handle.lock();

        let mut rule = self.load(rule_id)?;
        if rule.status != RuleStatus::Rejected {
            return Err(Self::invalid(&rule, "resubmit"));
        }
        let previous = rule.status;
        let now = self.clock.now();
        self.store.clear_approvals(rule_id)?;
        rule.status = RuleStatus::Pending;
        rule.submitted_at = Some(now);
        rule.updated_at = now;
        self.store.update_rule(&rule)?;
        self.store
            .append_audit(&self.audit(entity::RULE, rule_id, "resubmitted", actor))?;
        Ok(Transition { rule, previous })
    }

    /// APPROVED | PENDING -> DRAFT, clearing every approval record
    pub fn reset(&self, rule_id: &str, actor: &str) -> Result<Transition> {
        let transition = {
            let handle = self.locks.handle(rule_id);
            let _guard = handle.lock();

            let mut rule = self.load(rule_id)?;
            if !matches!(rule.status, RuleStatus::Approved | RuleStatus::Pending) {
                return Err(Self::invalid(&rule, "reset"));
            }
            let previous = rule.status;
            self.store.clear_approvals(rule_id)?;
            rule.status = RuleStatus::Draft;
            rule.approved_at = None;
            rule.resolved_by = None;
            rule.updated_at = self.clock.now();
            self.store.update_rule(&rule)?;
            self.store.append_audit(
                &self
                    .audit(entity::RULE, rule_id, "reset", actor)
                    .with_details(json!({ "from": previous })),
            )?;
            Transition { rule, previous }
        };

        if transition.previous == RuleStatus::Approved {
            self.distributor.broadcast();
        }
        Ok(transition)
    }

    /// Record one voter's decision on a pending rule
    pub fn vote(
        &self,
        rule_id: &str,
        voter_id: &str,
        decision: ApprovalDecision,
        comment: Option<String>,
    ) -> Result<VoteOutcome> {
        let outcome = {
            let handle = self.locks.handle(rule_id);
            let _guard = handle.lock();
            self.vote_locked(rule_id, voter_id, decision, comment)?
        };

        if outcome.promoted {
            self.distributor.broadcast();
        }
        Ok(outcome)
    }

    fn vote_locked(
        &self,
        rule_id: &str,
        voter_id: &str,
        decision: ApprovalDecision,
        comment: Option<String>,
    ) -> Result<VoteOutcome> {
        let mut rule = self.load(rule_id)?;
        if rule.status != RuleStatus::Pending {
            return Err(EdictError::NotPending {
                rule_id: rule_id.to_string(),
                status: rule.status.to_string(),
            });
        }

        let config = self.approval_config_for(&rule)?;
        if !self.oracle.has_permission(voter_id, &config.permission) {
            return Err(EdictError::NoPermission {
                user_id: voter_id.to_string(),
                permission: config.permission,
            });
        }

        let comment = comment.filter(|c| !c.trim().is_empty());
        if decision == ApprovalDecision::Rejected && comment.is_none() {
            return Err(EdictError::validation("a rejection requires a comment"));
        }

        let now = self.clock.now();
        self.store.insert_approval(&ApprovalRecord {
            rule_id: rule_id.to_string(),
            voter_id: voter_id.to_string(),
            decision,
            comment: comment.clone(),
            created_at: now,
        })?;
        self.store.append_audit(
            &self
                .audit(entity::RULE, rule_id, "voted", voter_id)
                .with_details(json!({ "decision": decision, "comment": comment })),
        )?;

        let approvals = self
            .store
            .list_approvals(rule_id)?
            .iter()
            .filter(|a| a.decision == ApprovalDecision::Approved)
            .count() as u32;

        if decision == ApprovalDecision::Rejected {
            rule.status = RuleStatus::Rejected;
            rule.resolved_by = Some(voter_id.to_string());
            rule.updated_at = now;
            self.store.update_rule(&rule)?;
            self.store
                .append_audit(&self.audit(entity::RULE, rule_id, "rejected", voter_id))?;
            tracing::info!(rule_id = %rule_id, voter = %voter_id, "rule rejected");
            return Ok(VoteOutcome {
                rule,
                approvals,
                required: config.required_count,
                promoted: false,
                attached_teams: Vec::new(),
            });
        }

        if approvals < config.required_count {
            tracing::debug!(
                rule_id = %rule_id,
                approvals,
                required = config.required_count,
                "approval recorded"
            );
            return Ok(VoteOutcome {
                rule,
                approvals,
                required: config.required_count,
                promoted: false,
                attached_teams: Vec::new(),
            });
        }

        rule.status = RuleStatus::Approved;
        rule.approved_at = Some(now);
        rule.resolved_by = Some(voter_id.to_string());
        rule.updated_at = now;
        self.store.update_rule(&rule)?;
        self.store.append_audit(
            &self
                .audit(entity::RULE, rule_id, "approved", voter_id)
                .with_details(json!({ "approvals": approvals, "required": config.required_count })),
        )?;
        tracing::info!(rule_id = %rule_id, approvals, "rule approved");

        let attached_teams = if rule.target_layer.is_global_scope() {
            self.auto_attach_all_teams(&rule, voter_id)
        } else {
            Vec::new()
        };

        Ok(VoteOutcome {
            rule,
            approvals,
            required: config.required_count,
            promoted: true,
            attached_teams,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Attachments
    // ═══════════════════════════════════════════════════════════════════════

    /// Request that `team_id` consume `rule_id`
    pub fn attach(&self, rule_id: &str, team_id: &str, requested_by: &str) -> Result<RuleAttachment> {
        self.load(rule_id)?;
        if self.directory.team(team_id).is_none() {
            return Err(EdictError::TeamNotFound {
                team_id: team_id.to_string(),
            });
        }
        let attachment = RuleAttachment {
            rule_id: rule_id.to_string(),
            team_id: team_id.to_string(),
            status: AttachmentStatus::Pending,
            requested_by: requested_by.to_string(),
            created_at: self.clock.now(),
        };
        self.store.insert_attachment(&attachment)?;
        self.store.append_audit(
            &self
                .audit(entity::ATTACHMENT, rule_id, "attach_requested", requested_by)
                .with_details(json!({ "team_id": team_id })),
        )?;
        Ok(attachment)
    }

    pub fn approve_attachment(&self, rule_id: &str, team_id: &str, actor: &str) -> Result<()> {
        self.store
            .set_attachment_status(rule_id, team_id, AttachmentStatus::Approved)?;
        self.store.append_audit(
            &self
                .audit(entity::ATTACHMENT, rule_id, "attach_approved", actor)
                .with_details(json!({ "team_id": team_id })),
        )
    }

    pub fn attachments(&self, rule_id: &str) -> Result<Vec<RuleAttachment>> {
        self.store.list_attachments(rule_id)
    }

    /// Attach an approved global rule to every team, already approved
    ///
    /// A team that is already attached is skipped. Any other failure is
    /// logged and skipped so one team cannot block the rest.
    pub fn auto_attach_all_teams(&self, rule: &Rule, actor: &str) -> Vec<String> {
        let mut attached = Vec::new();
        for team in self.directory.teams() {
            let attachment = RuleAttachment {
                rule_id: rule.id.clone(),
                team_id: team.id.clone(),
                status: AttachmentStatus::Approved,
                requested_by: actor.to_string(),
                created_at: self.clock.now(),
            };
            match self.store.insert_attachment(&attachment) {
                Ok(()) => attached.push(team.id),
                Err(EdictError::DuplicateAttachment { .. }) => {
                    tracing::debug!(rule_id = %rule.id, team_id = %team.id, "already attached");
                }
                Err(e) => {
                    tracing::warn!(
                        rule_id = %rule.id,
                        team_id = %team.id,
                        error = %e,
                        "auto-attachment failed"
                    );
                }
            }
        }
        if !attached.is_empty() {
            let event = self
                .audit(entity::ATTACHMENT, &rule.id, "auto_attached", actor)
                .with_details(json!({ "teams": attached }));
            if let Err(e) = self.store.append_audit(&event) {
                tracing::warn!(rule_id = %rule.id, error = %e, "failed to audit auto-attachment");
            }
        }
        attached
    }
}

//! Change-request state machine
//!
//! Drift reports from agents become change requests. A report for an
//! (agent, file) that already has a pending request updates it in place, so
//! repeated reports of the same drift collapse into one row.
//!
//! ```text
//! PENDING --approve--> APPROVED
//! PENDING --reject---> REJECTED
//! PENDING --timeout--> AUTO_REVERTED        (temporary enforcement only)
//! REJECTED | AUTO_REVERTED --exception approved--> EXCEPTION_GRANTED
//! ```

use std::sync::Arc;

use chrono::Duration;
use parking_lot::Mutex;
use serde_json::json;
use uuid::Uuid;

use crate::audit::{entity, AuditEvent};
use crate::clock::Clock;
use crate::directory::{permissions, PermissionOracle};
use crate::error::{EdictError, Result};
use crate::model::{ChangeRequest, ChangeStatus, EnforcementMode, NewChangeReport};
use crate::protocol::{ChangeApprovedPayload, ChangeRejectedPayload, Message};
use crate::storage::ControllerStore;

use super::Dispatcher;

/// Actor recorded for sweeper transitions
pub const SYSTEM_ACTOR: &str = "system";

/// Timeout applied when a temporary report names a rule without its own window
pub const DEFAULT_TEMPORARY_TIMEOUT_HOURS: u32 = 24;

/// Result of a drift report
#[derive(Debug, Clone)]
pub struct ReportOutcome {
    pub change: ChangeRequest,
    /// False when an existing pending request was updated
    pub created: bool,
}

/// Change-request ledger and its transitions
pub struct ChangeEngine {
    store: Arc<dyn ControllerStore>,
    oracle: Arc<dyn PermissionOracle>,
    clock: Arc<dyn Clock>,
    dispatcher: Arc<dyn Dispatcher>,
    // Serializes find-or-create and every transition out of PENDING
    ledger: Mutex<()>,
}

impl ChangeEngine {
    pub fn new(
        store: Arc<dyn ControllerStore>,
        oracle: Arc<dyn PermissionOracle>,
        clock: Arc<dyn Clock>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            store,
            oracle,
            clock,
            dispatcher,
            ledger: Mutex::new(()),
        }
    }

    pub fn get(&self, change_id: &str) -> Result<ChangeRequest> {
        self.store
            .get_change(change_id)?
            .ok_or_else(|| EdictError::ChangeNotFound {
                change_id: change_id.to_string(),
            })
    }

    pub fn list(&self, status: Option<ChangeStatus>) -> Result<Vec<ChangeRequest>> {
        self.store.list_changes(status)
    }

    /// Record a drift report: update the pending request for the same
    /// (agent, file) or open a new one
    pub fn report(&self, report: NewChangeReport) -> Result<ReportOutcome> {
        let rule = self
            .store
            .get_rule(&report.rule_id)?
            .ok_or_else(|| EdictError::RuleNotFound {
                rule_id: report.rule_id.clone(),
            })?;
        if self.store.get_agent(&report.agent_id)?.is_none() {
            return Err(EdictError::AgentNotFound {
                agent_id: report.agent_id.clone(),
            });
        }

        let _ledger = self.ledger.lock();
        let now = self.clock.now();

        if let Some(mut existing) = self
            .store
            .find_pending_change(&report.agent_id, &report.file_path)?
        {
            existing.modified_hash = report.modified_hash;
            existing.diff = report.diff;
            self.store.update_change(&existing)?;
            self.store.append_audit(
                &AuditEvent::new(entity::CHANGE, &existing.id, "updated", &report.user_id, now)
                    .with_details(json!({ "modified_hash": existing.modified_hash })),
            )?;
            tracing::debug!(change_id = %existing.id, "pending change updated in place");
            return Ok(ReportOutcome {
                change: existing,
                created: false,
            });
        }

        let timeout_at = (report.enforcement_mode == EnforcementMode::Temporary).then(|| {
            let hours = match rule.temporary_timeout_hours {
                0 => DEFAULT_TEMPORARY_TIMEOUT_HOURS,
                h => h,
            };
            now + Duration::hours(i64::from(hours))
        });

        let change = ChangeRequest {
            id: Uuid::new_v4().to_string(),
            rule_id: report.rule_id,
            agent_id: report.agent_id,
            user_id: report.user_id,
            team_id: report.team_id,
            file_path: report.file_path,
            original_hash: report.original_hash,
            modified_hash: report.modified_hash,
            diff: report.diff,
            status: ChangeStatus::Pending,
            enforcement_mode: report.enforcement_mode,
            timeout_at,
            created_at: now,
            resolved_at: None,
            resolved_by: None,
        };
        self.store.insert_change(&change)?;
        self.store.append_audit(
            &AuditEvent::new(entity::CHANGE, &change.id, "created", &change.user_id, now)
                .with_details(json!({
                    "rule_id": change.rule_id,
                    "file_path": change.file_path,
                    "enforcement_mode": change.enforcement_mode,
                })),
        )?;
        tracing::info!(
            change_id = %change.id,
            agent_id = %change.agent_id,
            mode = %change.enforcement_mode,
            "change request opened"
        );
        Ok(ReportOutcome {
            change,
            created: true,
        })
    }

    fn resolve(
        &self,
        change_id: &str,
        resolver: &str,
        status: ChangeStatus,
        action: &'static str,
    ) -> Result<ChangeRequest> {
        let _ledger = self.ledger.lock();
        let mut change = self.get(change_id)?;
        if !change.is_pending() {
            return Err(EdictError::InvalidState {
                entity: "change request",
                id: change.id,
                status: change.status.to_string(),
                action,
            });
        }
        let now = self.clock.now();
        change.status = status;
        change.resolved_at = Some(now);
        change.resolved_by = Some(resolver.to_string());
        self.store.update_change(&change)?;
        self.store.append_audit(&AuditEvent::new(
            entity::CHANGE,
            &change.id,
            status.as_str(),
            resolver,
            now,
        ))?;
        Ok(change)
    }

    fn require_permission(&self, user_id: &str) -> Result<()> {
        if self
            .oracle
            .has_permission(user_id, permissions::CHANGES_RESOLVE)
        {
            Ok(())
        } else {
            Err(EdictError::NoPermission {
                user_id: user_id.to_string(),
                permission: permissions::CHANGES_RESOLVE.to_string(),
            })
        }
    }

    /// PENDING -> APPROVED; notifies the originating agent
    pub fn approve(&self, change_id: &str, resolver: &str) -> Result<ChangeRequest> {
        self.require_permission(resolver)?;
        let change = self.resolve(change_id, resolver, ChangeStatus::Approved, "approve")?;
        self.push(
            &change.agent_id,
            Message::ChangeApproved(ChangeApprovedPayload {
                change_id: change.id.clone(),
                rule_id: change.rule_id.clone(),
                file_path: Some(change.file_path.clone()),
            }),
        );
        Ok(change)
    }

    /// PENDING -> REJECTED; tells the agent to revert to the original hash
    pub fn reject(&self, change_id: &str, resolver: &str) -> Result<ChangeRequest> {
        self.require_permission(resolver)?;
        let change = self.resolve(change_id, resolver, ChangeStatus::Rejected, "reject")?;
        self.push(&change.agent_id, rejection(&change, false));
        Ok(change)
    }

    /// Auto-revert every temporary change whose window has elapsed
    pub fn sweep_expired(&self) -> Result<Vec<ChangeRequest>> {
        let now = self.clock.now();
        let expired: Vec<String> = self
            .store
            .list_changes(Some(ChangeStatus::Pending))?
            .into_iter()
            .filter(|c| c.is_expired_at(now))
            .map(|c| c.id)
            .collect();

        let mut reverted = Vec::with_capacity(expired.len());
        for change_id in expired {
            match self.resolve(&change_id, SYSTEM_ACTOR, ChangeStatus::AutoReverted, "auto-revert") {
                Ok(change) => {
                    tracing::info!(change_id = %change.id, agent_id = %change.agent_id, "change auto-reverted");
                    self.push(&change.agent_id, rejection(&change, true));
                    reverted.push(change);
                }
                // Resolved by someone else since the scan
                Err(EdictError::InvalidState { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(reverted)
    }

    /// REJECTED | AUTO_REVERTED -> EXCEPTION_GRANTED
    pub(crate) fn mark_exception_granted(
        &self,
        change_id: &str,
        resolver: &str,
    ) -> Result<ChangeRequest> {
        let _ledger = self.ledger.lock();
        let mut change = self.get(change_id)?;
        if !change.status.accepts_exception() {
            return Err(EdictError::NotRejected {
                change_id: change.id,
                status: change.status.to_string(),
            });
        }
        let now = self.clock.now();
        change.status = ChangeStatus::ExceptionGranted;
        change.resolved_at = Some(now);
        change.resolved_by = Some(resolver.to_string());
        self.store.update_change(&change)?;
        self.store.append_audit(&AuditEvent::new(
            entity::CHANGE,
            &change.id,
            "exception_granted",
            resolver,
            now,
        ))?;
        Ok(change)
    }

    fn push(&self, agent_id: &str, message: Message) {
        let kind = message.message_type();
        if !self.dispatcher.dispatch(agent_id, message) {
            tracing::debug!(agent_id = %agent_id, message = %kind, "agent offline; dropped at edge");
        }
    }
}

fn rejection(change: &ChangeRequest, auto_reverted: bool) -> Message {
    Message::ChangeRejected(ChangeRejectedPayload {
        change_id: change.id.clone(),
        rule_id: change.rule_id.clone(),
        revert_to_hash: change.original_hash.clone(),
        file_path: Some(change.file_path.clone()),
        auto_reverted,
    })
}

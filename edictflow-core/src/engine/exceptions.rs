//! Exception-request state machine
//!
//! An exception waives a refused change. It can only be requested against a
//! change request that is REJECTED or AUTO_REVERTED.

use std::sync::Arc;

use chrono::Duration;
use serde_json::json;
use uuid::Uuid;

use crate::audit::{entity, AuditEvent};
use crate::clock::Clock;
use crate::directory::{permissions, PermissionOracle};
use crate::error::{EdictError, Result};
use crate::model::{ExceptionRequest, ExceptionStatus, ExceptionType};
use crate::protocol::{ExceptionDeniedPayload, ExceptionGrantedPayload, Message};
use crate::storage::ControllerStore;

use super::changes::ChangeEngine;
use super::Dispatcher;

/// Input for an exception request
#[derive(Debug, Clone)]
pub struct NewException {
    pub change_id: String,
    pub user_id: String,
    pub justification: String,
    pub exception_type: ExceptionType,
    pub duration_hours: Option<u32>,
}

pub struct ExceptionEngine {
    store: Arc<dyn ControllerStore>,
    oracle: Arc<dyn PermissionOracle>,
    clock: Arc<dyn Clock>,
    dispatcher: Arc<dyn Dispatcher>,
    changes: Arc<ChangeEngine>,
}

impl ExceptionEngine {
    pub fn new(
        store: Arc<dyn ControllerStore>,
        oracle: Arc<dyn PermissionOracle>,
        clock: Arc<dyn Clock>,
        dispatcher: Arc<dyn Dispatcher>,
        changes: Arc<ChangeEngine>,
    ) -> Self {
        Self {
            store,
            oracle,
            clock,
            dispatcher,
            changes,
        }
    }

    pub fn get(&self, exception_id: &str) -> Result<ExceptionRequest> {
        self.store
            .get_exception(exception_id)?
            .ok_or_else(|| EdictError::ExceptionNotFound {
                exception_id: exception_id.to_string(),
            })
    }

    pub fn list(&self) -> Result<Vec<ExceptionRequest>> {
        self.store.list_exceptions()
    }

    /// Open a pending exception against a refused change
    pub fn request(&self, input: NewException) -> Result<ExceptionRequest> {
        if input.justification.trim().is_empty() {
            return Err(EdictError::validation("an exception requires a justification"));
        }
        if input.exception_type == ExceptionType::TimeLimited
            && input.duration_hours.unwrap_or(0) == 0
        {
            return Err(EdictError::validation(
                "a time-limited exception requires duration_hours > 0",
            ));
        }

        let change = self.changes.get(&input.change_id)?;
        if !change.status.accepts_exception() {
            return Err(EdictError::NotRejected {
                change_id: change.id,
                status: change.status.to_string(),
            });
        }

        let now = self.clock.now();
        let exception = ExceptionRequest {
            id: Uuid::new_v4().to_string(),
            change_request_id: change.id,
            user_id: input.user_id,
            justification: input.justification,
            exception_type: input.exception_type,
            duration_hours: match input.exception_type {
                ExceptionType::TimeLimited => input.duration_hours,
                ExceptionType::Permanent => None,
            },
            expires_at: None,
            status: ExceptionStatus::Pending,
            created_at: now,
            resolved_at: None,
            resolved_by: None,
        };
        self.store.insert_exception(&exception)?;
        self.store.append_audit(
            &AuditEvent::new(entity::EXCEPTION, &exception.id, "requested", &exception.user_id, now)
                .with_details(json!({
                    "change_id": exception.change_request_id,
                    "type": exception.exception_type,
                })),
        )?;
        tracing::info!(
            exception_id = %exception.id,
            change_id = %exception.change_request_id,
            "exception requested"
        );
        Ok(exception)
    }

    fn require_permission(&self, user_id: &str) -> Result<()> {
        if self
            .oracle
            .has_permission(user_id, permissions::EXCEPTIONS_RESOLVE)
        {
            Ok(())
        } else {
            Err(EdictError::NoPermission {
                user_id: user_id.to_string(),
                permission: permissions::EXCEPTIONS_RESOLVE.to_string(),
            })
        }
    }

    fn load_pending(&self, exception_id: &str, action: &'static str) -> Result<ExceptionRequest> {
        let exception = self.get(exception_id)?;
        if exception.status != ExceptionStatus::Pending {
            return Err(EdictError::InvalidState {
                entity: "exception request",
                id: exception.id,
                status: exception.status.to_string(),
                action,
            });
        }
        Ok(exception)
    }

    /// Approve: set expiry, flip the change to EXCEPTION_GRANTED, notify the agent
    pub fn approve(&self, exception_id: &str, resolver: &str) -> Result<ExceptionRequest> {
        self.require_permission(resolver)?;
        let mut exception = self.load_pending(exception_id, "approve")?;

        let change = self
            .changes
            .mark_exception_granted(&exception.change_request_id, resolver)?;

        let now = self.clock.now();
        exception.status = ExceptionStatus::Approved;
        exception.expires_at = match exception.exception_type {
            ExceptionType::TimeLimited => exception
                .duration_hours
                .map(|h| now + Duration::hours(i64::from(h))),
            ExceptionType::Permanent => None,
        };
        exception.resolved_at = Some(now);
        exception.resolved_by = Some(resolver.to_string());
        self.store.update_exception(&exception)?;
        self.store.append_audit(
            &AuditEvent::new(entity::EXCEPTION, &exception.id, "approved", resolver, now)
                .with_details(json!({ "expires_at": exception.expires_at })),
        )?;

        let granted = Message::ExceptionGranted(ExceptionGrantedPayload {
            exception_id: exception.id.clone(),
            change_id: change.id.clone(),
            rule_id: change.rule_id.clone(),
            file_path: Some(change.file_path.clone()),
            expires_at: exception.expires_at,
        });
        if !self.dispatcher.dispatch(&change.agent_id, granted) {
            tracing::debug!(agent_id = %change.agent_id, "agent offline; exception_granted dropped");
        }
        Ok(exception)
    }

    /// Deny: PENDING -> DENIED, notify the agent
    pub fn deny(&self, exception_id: &str, resolver: &str) -> Result<ExceptionRequest> {
        self.require_permission(resolver)?;
        let mut exception = self.load_pending(exception_id, "deny")?;
        let change = self.changes.get(&exception.change_request_id)?;

        let now = self.clock.now();
        exception.status = ExceptionStatus::Denied;
        exception.resolved_at = Some(now);
        exception.resolved_by = Some(resolver.to_string());
        self.store.update_exception(&exception)?;
        self.store
            .append_audit(&AuditEvent::new(entity::EXCEPTION, &exception.id, "denied", resolver, now))?;

        let denied = Message::ExceptionDenied(ExceptionDeniedPayload {
            exception_id: exception.id.clone(),
            change_id: change.id.clone(),
            file_path: Some(change.file_path.clone()),
        });
        if !self.dispatcher.dispatch(&change.agent_id, denied) {
            tracing::debug!(agent_id = %change.agent_id, "agent offline; exception_denied dropped");
        }
        Ok(exception)
    }

    /// Whether `user_id` holds an active exception for `rule_id` on `file_path`
    pub fn has_active_exception(&self, user_id: &str, rule_id: &str, file_path: &str) -> Result<bool> {
        let now = self.clock.now();
        for exception in self.store.list_exceptions()? {
            if exception.user_id != user_id || !exception.is_active_at(now) {
                continue;
            }
            if let Some(change) = self.store.get_change(&exception.change_request_id)? {
                if change.rule_id == rule_id && change.file_path == file_path {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

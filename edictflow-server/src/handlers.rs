//! Agent message handlers
//!
//! The session reader decodes each frame and hands it here. Handlers run the
//! corresponding controller operation and return the frames to send back on
//! the same session, so replies keep FIFO order with everything else the
//! session writes.
//!
//! Every agent-originated message carrying a `ref_id` is acknowledged once
//! it has been applied. A refusal the agent cannot fix by retrying (not
//! found, invalid state, validation) is acknowledged with the error code so
//! the agent retires it; a retryable failure is left unacknowledged and the
//! agent's queue sends it again.

use edictflow_core::audit::{entity, AuditEvent};
use edictflow_core::engine::{Controller, NewException};
use edictflow_core::model::NewChangeReport;
use edictflow_core::protocol::{
    AckPayload, ChangeDetectedPayload, ContextDetectedPayload, DriftReportPayload, Envelope,
    ExceptionRequestPayload, HeartbeatPayload, Message, RevertCompletePayload,
    SyncCompletePayload,
};
use edictflow_core::{EdictError, Result};
use serde_json::json;

/// Identity of the session a frame arrived on
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub agent_id: String,
    pub user_id: String,
}

/// Apply one inbound envelope; returns replies for the same session
pub fn handle_envelope(controller: &Controller, ctx: &SessionContext, envelope: &Envelope) -> Vec<Message> {
    let message = match envelope.message() {
        Ok(Some(message)) => message,
        Ok(None) => {
            tracing::debug!(agent_id = %ctx.agent_id, message = %envelope.message_type, "unknown message type dropped");
            return Vec::new();
        }
        Err(e) => {
            tracing::warn!(agent_id = %ctx.agent_id, message = %envelope.message_type, error = %e, "malformed payload");
            return acknowledge(envelope, Err(e)).into_iter().collect();
        }
    };

    if message.message_type().is_controller_originated() {
        tracing::warn!(agent_id = %ctx.agent_id, message = %envelope.message_type, "agent sent a controller message; dropped");
        return Vec::new();
    }

    match message {
        Message::Heartbeat(payload) => on_heartbeat(controller, ctx, payload),
        Message::ChangeDetected(payload) | Message::ChangeUpdated(payload) => {
            let result = on_change(controller, ctx, payload).map(Some);
            acknowledge(envelope, result).into_iter().collect()
        }
        Message::ExceptionRequest(payload) => {
            let result = on_exception_request(controller, ctx, payload).map(Some);
            acknowledge(envelope, result).into_iter().collect()
        }
        Message::DriftReport(payload) => {
            on_drift_report(ctx, &payload);
            acknowledge(envelope, Ok(None)).into_iter().collect()
        }
        Message::ContextDetected(payload) => {
            on_context_detected(ctx, &payload);
            acknowledge(envelope, Ok(None)).into_iter().collect()
        }
        Message::SyncComplete(payload) => {
            on_sync_complete(controller, ctx, &payload);
            acknowledge(envelope, Ok(None)).into_iter().collect()
        }
        Message::RevertComplete(payload) => {
            let result = on_revert_complete(controller, ctx, payload).map(|_| None);
            acknowledge(envelope, result).into_iter().collect()
        }
        _ => Vec::new(),
    }
}

fn acknowledge(envelope: &Envelope, result: Result<Option<String>>) -> Option<Message> {
    let ref_id = envelope.ref_id().to_string();
    match result {
        Ok(entity_id) => Some(Message::Ack(AckPayload {
            ref_id,
            entity_id,
            error: None,
        })),
        Err(e) if e.is_retryable() => {
            tracing::warn!(ref_id = %ref_id, error = %e, "transient failure; leaving unacknowledged");
            None
        }
        Err(e) => Some(Message::Ack(AckPayload {
            ref_id,
            entity_id: None,
            error: Some(e.error_code().to_string()),
        })),
    }
}

/// Refresh last-seen and push the config when the agent's version is stale
fn on_heartbeat(controller: &Controller, ctx: &SessionContext, payload: HeartbeatPayload) -> Vec<Message> {
    if let Err(e) = controller.touch_agent(&ctx.agent_id, payload.hostname) {
        tracing::warn!(agent_id = %ctx.agent_id, error = %e, "failed to record heartbeat");
    }
    match controller.distribution().config_for_agent(&ctx.agent_id) {
        Ok(config) if config.version != payload.cached_version => {
            tracing::debug!(
                agent_id = %ctx.agent_id,
                cached = payload.cached_version,
                current = config.version,
                "agent config stale"
            );
            vec![Message::ConfigUpdate(config)]
        }
        Ok(_) => Vec::new(),
        Err(e) => {
            tracing::warn!(agent_id = %ctx.agent_id, error = %e, "failed to compute config");
            Vec::new()
        }
    }
}

fn on_change(controller: &Controller, ctx: &SessionContext, payload: ChangeDetectedPayload) -> Result<String> {
    let team_id = controller
        .store()
        .get_agent(&ctx.agent_id)?
        .and_then(|agent| agent.team_id);
    let outcome = controller.changes().report(NewChangeReport {
        rule_id: payload.rule_id,
        agent_id: ctx.agent_id.clone(),
        user_id: ctx.user_id.clone(),
        team_id,
        file_path: payload.file_path,
        original_hash: payload.original_hash,
        modified_hash: payload.modified_hash,
        diff: payload.diff,
        enforcement_mode: payload.enforcement_mode,
    })?;
    Ok(outcome.change.id)
}

fn on_exception_request(
    controller: &Controller,
    ctx: &SessionContext,
    payload: ExceptionRequestPayload,
) -> Result<String> {
    let change = controller.changes().get(&payload.change_id)?;
    if change.agent_id != ctx.agent_id {
        return Err(EdictError::validation(
            "exceptions can only be requested for this agent's own changes",
        ));
    }
    let exception = controller.exceptions().request(NewException {
        change_id: payload.change_id,
        user_id: ctx.user_id.clone(),
        justification: payload.justification,
        exception_type: payload.exception_type,
        duration_hours: payload.duration_hours,
    })?;
    Ok(exception.id)
}

fn on_drift_report(ctx: &SessionContext, payload: &DriftReportPayload) {
    if payload.drifted.is_empty() {
        tracing::debug!(agent_id = %ctx.agent_id, checked = payload.checked, "no drift");
        return;
    }
    for entry in &payload.drifted {
        tracing::info!(
            agent_id = %ctx.agent_id,
            file = %entry.file_path,
            expected = %entry.expected_hash,
            actual = %entry.actual_hash,
            "drift reported"
        );
    }
}

fn on_context_detected(ctx: &SessionContext, payload: &ContextDetectedPayload) {
    tracing::info!(
        agent_id = %ctx.agent_id,
        project = %payload.project_path,
        contexts = ?payload.context_types,
        "project context detected"
    );
}

fn on_sync_complete(controller: &Controller, ctx: &SessionContext, payload: &SyncCompletePayload) {
    let current = controller.distribution().versions().latest();
    tracing::info!(
        agent_id = %ctx.agent_id,
        version = payload.version,
        files = payload.files_written,
        latest = current,
        "agent sync complete"
    );
}

fn on_revert_complete(controller: &Controller, ctx: &SessionContext, payload: RevertCompletePayload) -> Result<()> {
    tracing::info!(agent_id = %ctx.agent_id, file = %payload.file_path, "revert complete");
    if let Some(change_id) = payload.change_id {
        let event = AuditEvent::new(
            entity::CHANGE,
            &change_id,
            "revert_complete",
            &ctx.user_id,
            controller.clock().now(),
        )
        .with_details(json!({ "file_path": payload.file_path, "new_hash": payload.new_hash }));
        controller.store().append_audit(&event)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use edictflow_core::directory::{StaticDirectory, Team};
    use edictflow_core::model::{ApprovalDecision, ChangeStatus, EnforcementMode, NewRule, TargetLayer};
    use edictflow_core::protocol::AgentStatus;

    fn controller() -> (Controller, SessionContext) {
        let directory = StaticDirectory::new()
            .with_team(Team::new("web").inheriting_global())
            .with_member("dev", "web")
            .with_permission("lead", "*");
        let controller = Controller::builder().directory(Arc::new(directory)).build();
        controller.register_agent("agent-1", "dev", None).unwrap();
        let ctx = SessionContext {
            agent_id: "agent-1".into(),
            user_id: "dev".into(),
        };
        (controller, ctx)
    }

    fn approved_rule(controller: &Controller) -> String {
        let rules = controller.rules();
        let rule = rules
            .create(NewRule::new("Guarded", "body", TargetLayer::Organization), "admin")
            .unwrap();
        rules.submit(&rule.id, "admin").unwrap();
        rules.vote(&rule.id, "lead", ApprovalDecision::Approved, None).unwrap();
        rule.id
    }

    fn heartbeat(version: u64) -> Envelope {
        Envelope::new(Message::Heartbeat(HeartbeatPayload {
            status: AgentStatus::Online,
            cached_version: version,
            active_projects: vec![],
            hostname: Some("laptop".into()),
            agent_version: None,
        }))
        .unwrap()
    }

    fn change_detected(ref_id: &str, rule_id: &str, modified: &str) -> Envelope {
        Envelope::with_ref_id(
            ref_id,
            Message::ChangeDetected(ChangeDetectedPayload {
                rule_id: rule_id.into(),
                file_path: "/w/CLAUDE.md".into(),
                original_hash: "aaaa".into(),
                modified_hash: modified.into(),
                diff: "+x".into(),
                enforcement_mode: EnforcementMode::Block,
            }),
        )
        .unwrap()
    }

    #[test]
    fn test_heartbeat_pushes_config_only_when_stale() {
        let (controller, ctx) = controller();
        approved_rule(&controller);

        let replies = handle_envelope(&controller, &ctx, &heartbeat(0));
        let version = match replies.as_slice() {
            [Message::ConfigUpdate(config)] => {
                assert_eq!(config.rules.len(), 1);
                config.version
            }
            other => panic!("expected config_update, got {:?}", other),
        };

        assert!(handle_envelope(&controller, &ctx, &heartbeat(version)).is_empty());
        let agent = controller.store().get_agent("agent-1").unwrap().unwrap();
        assert_eq!(agent.hostname.as_deref(), Some("laptop"));
    }

    #[test]
    fn test_change_detected_is_acknowledged_with_change_id() {
        let (controller, ctx) = controller();
        let rule_id = approved_rule(&controller);

        let replies = handle_envelope(&controller, &ctx, &change_detected("ref-1", &rule_id, "bbbb"));
        let change_id = match replies.as_slice() {
            [Message::Ack(ack)] => {
                assert_eq!(ack.ref_id, "ref-1");
                assert!(ack.error.is_none());
                ack.entity_id.clone().unwrap()
            }
            other => panic!("expected ack, got {:?}", other),
        };

        // Replay of the same drift updates the same request
        let replies = handle_envelope(&controller, &ctx, &change_detected("ref-2", &rule_id, "cccc"));
        assert!(matches!(
            replies.as_slice(),
            [Message::Ack(ack)] if ack.entity_id.as_deref() == Some(change_id.as_str())
        ));
        let pending = controller.changes().list(Some(ChangeStatus::Pending)).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].modified_hash, "cccc");
        assert_eq!(pending[0].team_id.as_deref(), Some("web"));
    }

    #[test]
    fn test_refused_report_is_acknowledged_with_error() {
        let (controller, ctx) = controller();
        let replies = handle_envelope(&controller, &ctx, &change_detected("ref-1", "missing", "bbbb"));
        assert!(matches!(
            replies.as_slice(),
            [Message::Ack(ack)] if ack.error.as_deref() == Some("RULE_NOT_FOUND")
        ));
    }

    #[test]
    fn test_exception_request_over_session() {
        let (controller, ctx) = controller();
        let rule_id = approved_rule(&controller);
        handle_envelope(&controller, &ctx, &change_detected("ref-1", &rule_id, "bbbb"));
        let change = controller.changes().list(None).unwrap().remove(0);
        controller.changes().reject(&change.id, "lead").unwrap();

        let request = Envelope::with_ref_id(
            "ref-3",
            Message::ExceptionRequest(ExceptionRequestPayload {
                change_id: change.id.clone(),
                justification: "hotfix".into(),
                exception_type: edictflow_core::model::ExceptionType::Permanent,
                duration_hours: None,
            }),
        )
        .unwrap();
        let replies = handle_envelope(&controller, &ctx, &request);
        assert!(matches!(
            replies.as_slice(),
            [Message::Ack(ack)] if ack.entity_id.is_some() && ack.error.is_none()
        ));
        assert_eq!(controller.exceptions().list().unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_and_misdirected_frames_are_dropped() {
        let (controller, ctx) = controller();
        let unknown = Envelope {
            message_type: "telemetry".into(),
            id: "m-1".into(),
            timestamp: chrono::Utc::now(),
            payload: json!({}),
        };
        assert!(handle_envelope(&controller, &ctx, &unknown).is_empty());

        let misdirected = Envelope::new(Message::Ack(AckPayload::ok("x"))).unwrap();
        assert!(handle_envelope(&controller, &ctx, &misdirected).is_empty());
    }

    #[test]
    fn test_malformed_payload_is_retired() {
        let (controller, ctx) = controller();
        let broken = Envelope {
            message_type: "change_detected".into(),
            id: "m-9".into(),
            timestamp: chrono::Utc::now(),
            payload: json!({ "rule_id": 7 }),
        };
        assert!(matches!(
            handle_envelope(&controller, &ctx, &broken).as_slice(),
            [Message::Ack(ack)] if ack.ref_id == "m-9" && ack.error.as_deref() == Some("INVALID_MESSAGE")
        ));
    }

    #[test]
    fn test_revert_complete_is_audited() {
        let (controller, ctx) = controller();
        let env = Envelope::with_ref_id(
            "ref-5",
            Message::RevertComplete(RevertCompletePayload {
                change_id: Some("c-1".into()),
                file_path: "/w/CLAUDE.md".into(),
                new_hash: "aaaa".into(),
            }),
        )
        .unwrap();
        assert_eq!(handle_envelope(&controller, &ctx, &env).len(), 1);
        let trail = controller.audit_trail("c-1").unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].action, "revert_complete");
    }
}

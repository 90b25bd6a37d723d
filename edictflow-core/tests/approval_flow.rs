//! Rule lifecycle and approval accounting through the public controller API

use std::sync::Arc;

use edictflow_core::directory::{StaticDirectory, Team};
use edictflow_core::engine::{Controller, RecordingDispatcher, RuleFilter};
use edictflow_core::model::{
    ApprovalConfig, ApprovalDecision, AttachmentStatus, NewRule, RulePatch, RuleStatus,
    TargetLayer,
};
use edictflow_core::protocol::Message;
use edictflow_core::{EdictError, ErrorCategory};

fn directory() -> StaticDirectory {
    StaticDirectory::new()
        .with_team(Team::new("web").inheriting_global())
        .with_team(Team::new("platform"))
        .with_member("dev", "web")
        .with_permission("alice", "rules.approve")
        .with_permission("bob", "rules.approve")
        .with_permission("carol", "rules.approve")
}

fn controller_with(dispatcher: Arc<RecordingDispatcher>) -> Controller {
    let controller = Controller::builder()
        .directory(Arc::new(directory()))
        .dispatcher(dispatcher)
        .build();
    controller
        .rules()
        .set_approval_config(ApprovalConfig::global(TargetLayer::Project, "rules.approve", 2))
        .unwrap();
    controller
}

fn controller() -> Controller {
    controller_with(Arc::new(RecordingDispatcher::new()))
}

fn pending_rule(controller: &Controller) -> String {
    let rule = controller
        .rules()
        .create(NewRule::new("Lint", "Run clippy before pushing.", TargetLayer::Project), "author")
        .unwrap();
    controller.rules().submit(&rule.id, "author").unwrap();
    rule.id
}

#[test]
fn test_two_approvals_promote_rule() {
    let controller = controller();
    let rules = controller.rules();
    let id = pending_rule(&controller);

    let first = rules.vote(&id, "alice", ApprovalDecision::Approved, None).unwrap();
    assert_eq!(first.rule.status, RuleStatus::Pending);
    assert_eq!(first.approvals, 1);
    assert!(!first.promoted);

    let second = rules.vote(&id, "bob", ApprovalDecision::Approved, None).unwrap();
    assert!(second.promoted);
    assert_eq!(second.approvals, 2);
    assert_eq!(second.required, 2);

    let stored = rules.get(&id).unwrap();
    assert_eq!(stored.status, RuleStatus::Approved);
    assert!(stored.approved_at.is_some());
    assert!(stored.submitted_at.is_some());
    assert_eq!(stored.resolved_by.as_deref(), Some("bob"));

    // The count at promotion equals the stored approved records
    let approved = rules
        .approvals(&id)
        .unwrap()
        .into_iter()
        .filter(|a| a.decision == ApprovalDecision::Approved)
        .count();
    assert_eq!(approved as u32, second.approvals);
}

#[test]
fn test_duplicate_vote_leaves_records_unchanged() {
    let controller = controller();
    let rules = controller.rules();
    let id = pending_rule(&controller);

    rules.vote(&id, "alice", ApprovalDecision::Approved, None).unwrap();
    let err = rules
        .vote(&id, "alice", ApprovalDecision::Approved, None)
        .unwrap_err();
    assert!(matches!(err, EdictError::DuplicateVote { .. }));
    assert_eq!(err.category(), ErrorCategory::Conflict);

    let voters: Vec<_> = rules.approvals(&id).unwrap().into_iter().map(|a| a.voter_id).collect();
    assert_eq!(voters, vec!["alice"]);
}

#[test]
fn test_reject_requires_comment() {
    let controller = controller();
    let rules = controller.rules();
    let id = pending_rule(&controller);

    let err = rules
        .vote(&id, "carol", ApprovalDecision::Rejected, Some("  ".into()))
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Validation);
    assert_eq!(rules.get(&id).unwrap().status, RuleStatus::Pending);

    let outcome = rules
        .vote(&id, "carol", ApprovalDecision::Rejected, Some("too strict".into()))
        .unwrap();
    assert_eq!(outcome.rule.status, RuleStatus::Rejected);
    assert_eq!(rules.get(&id).unwrap().resolved_by.as_deref(), Some("carol"));
}

#[test]
fn test_vote_preconditions() {
    let controller = controller();
    let rules = controller.rules();
    let draft = rules
        .create(NewRule::new("Draft", "body", TargetLayer::Project), "author")
        .unwrap();

    let err = rules
        .vote(&draft.id, "alice", ApprovalDecision::Approved, None)
        .unwrap_err();
    assert!(matches!(err, EdictError::NotPending { .. }));

    let id = pending_rule(&controller);
    let err = rules
        .vote(&id, "mallory", ApprovalDecision::Approved, None)
        .unwrap_err();
    assert!(matches!(err, EdictError::NoPermission { .. }));

    let err = rules
        .vote("missing", "alice", ApprovalDecision::Approved, None)
        .unwrap_err();
    assert!(matches!(err, EdictError::RuleNotFound { .. }));
}

#[test]
fn test_team_override_tightens_count() {
    let controller = controller();
    let rules = controller.rules();
    rules
        .set_approval_config(
            ApprovalConfig::global(TargetLayer::Project, "rules.approve", 3).for_team("platform"),
        )
        .unwrap();

    let mut input = NewRule::new("Platform rule", "body", TargetLayer::Project);
    input.team_id = Some("platform".into());
    let rule = rules.create(input, "author").unwrap();
    rules.submit(&rule.id, "author").unwrap();

    rules.vote(&rule.id, "alice", ApprovalDecision::Approved, None).unwrap();
    let second = rules.vote(&rule.id, "bob", ApprovalDecision::Approved, None).unwrap();
    assert!(!second.promoted);
    assert_eq!(second.required, 3);
    let third = rules.vote(&rule.id, "carol", ApprovalDecision::Approved, None).unwrap();
    assert!(third.promoted);
}

#[test]
fn test_invalid_transitions() {
    let controller = controller();
    let rules = controller.rules();
    let id = pending_rule(&controller);

    assert!(matches!(
        rules.submit(&id, "author"),
        Err(EdictError::InvalidState { .. })
    ));
    assert!(matches!(
        rules.resubmit(&id, "author"),
        Err(EdictError::InvalidState { .. })
    ));
    assert!(matches!(
        rules.update(&id, RulePatch { body: Some("new".into()), ..Default::default() }, "author"),
        Err(EdictError::InvalidState { .. })
    ));
    assert!(matches!(
        rules.delete(&id, "author"),
        Err(EdictError::InvalidState { .. })
    ));

    let draft = rules
        .create(NewRule::new("Draft", "body", TargetLayer::Project), "author")
        .unwrap();
    assert!(matches!(
        rules.reset(&draft.id, "author"),
        Err(EdictError::InvalidState { .. })
    ));
}

#[test]
fn test_resubmit_starts_fresh_round() {
    let controller = controller();
    let rules = controller.rules();
    let id = pending_rule(&controller);

    rules.vote(&id, "alice", ApprovalDecision::Approved, None).unwrap();
    rules
        .vote(&id, "bob", ApprovalDecision::Rejected, Some("needs examples".into()))
        .unwrap();

    let transition = rules.resubmit(&id, "author").unwrap();
    assert_eq!(transition.previous, RuleStatus::Rejected);
    assert_eq!(transition.rule.status, RuleStatus::Pending);
    assert!(transition.rule.resolved_by.is_none());
    assert!(rules.approvals(&id).unwrap().is_empty());

    // Previous voters may vote again
    rules.vote(&id, "bob", ApprovalDecision::Approved, None).unwrap();
}

#[test]
fn test_reset_clears_approvals_and_returns_to_draft() {
    let controller = controller();
    let rules = controller.rules();
    let id = pending_rule(&controller);
    rules.vote(&id, "alice", ApprovalDecision::Approved, None).unwrap();
    rules.vote(&id, "bob", ApprovalDecision::Approved, None).unwrap();

    let transition = rules.reset(&id, "author").unwrap();
    assert_eq!(transition.previous, RuleStatus::Approved);
    assert_eq!(transition.rule.status, RuleStatus::Draft);
    assert!(transition.rule.approved_at.is_none());
    assert!(rules.approvals(&id).unwrap().is_empty());

    // Editable again once back in draft
    let updated = rules
        .update(&id, RulePatch { body: Some("Run clippy -D warnings.".into()), ..Default::default() }, "author")
        .unwrap();
    assert_eq!(updated.body, "Run clippy -D warnings.");
}

#[test]
fn test_draft_delete_and_listing() {
    let controller = controller();
    let rules = controller.rules();
    let keep = pending_rule(&controller);
    let gone = rules
        .create(NewRule::new("Temp", "body", TargetLayer::Local), "author")
        .unwrap();

    rules.delete(&gone.id, "author").unwrap();
    assert!(matches!(rules.get(&gone.id), Err(EdictError::RuleNotFound { .. })));

    let pending = rules
        .list(&RuleFilter {
            status: Some(RuleStatus::Pending),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, keep);
}

#[test]
fn test_global_approval_auto_attaches_every_team() {
    let controller = controller();
    let rules = controller.rules();
    let rule = rules
        .create(NewRule::new("Secrets", "Never commit secrets.", TargetLayer::Enterprise), "author")
        .unwrap();

    // One team asked for it already; auto-attachment skips it
    rules.attach(&rule.id, "web", "dev").unwrap();
    rules.submit(&rule.id, "author").unwrap();
    let outcome = rules
        .vote(&rule.id, "alice", ApprovalDecision::Approved, None)
        .unwrap();

    assert!(outcome.promoted);
    assert_eq!(outcome.attached_teams, vec!["platform".to_string()]);
    let attachments = rules.attachments(&rule.id).unwrap();
    assert_eq!(attachments.len(), 2);
    let platform = attachments.iter().find(|a| a.team_id == "platform").unwrap();
    assert_eq!(platform.status, AttachmentStatus::Approved);

    assert!(matches!(
        rules.attach(&rule.id, "web", "dev"),
        Err(EdictError::DuplicateAttachment { .. })
    ));
    assert!(matches!(
        rules.attach(&rule.id, "nowhere", "dev"),
        Err(EdictError::TeamNotFound { .. })
    ));
}

#[test]
fn test_promotion_broadcasts_config_to_connected_agents() {
    let dispatcher = Arc::new(RecordingDispatcher::new());
    let controller = controller_with(dispatcher.clone());
    controller.register_agent("agent-1", "dev", None).unwrap();
    dispatcher.connect("agent-1");

    let rules = controller.rules();
    let mut input = NewRule::new("Style", "Use rustfmt.", TargetLayer::Organization);
    input.force = true;
    let rule = rules.create(input, "author").unwrap();
    rules.submit(&rule.id, "author").unwrap();
    rules.vote(&rule.id, "alice", ApprovalDecision::Approved, None).unwrap();

    let sent = dispatcher.sent_to("agent-1");
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        Message::ConfigUpdate(config) => {
            assert_eq!(config.rules.len(), 1);
            assert_eq!(config.rules[0].id, rule.id);
            assert!(config.version >= 1);
        }
        other => panic!("expected config_update, got {:?}", other),
    }
}

#[test]
fn test_concurrent_votes_promote_exactly_once() {
    let controller = controller();
    let id = pending_rule(&controller);

    let handles: Vec<_> = ["alice", "bob", "carol"]
        .into_iter()
        .map(|voter| {
            let controller = controller.clone();
            let id = id.clone();
            std::thread::spawn(move || {
                controller
                    .rules()
                    .vote(&id, voter, ApprovalDecision::Approved, None)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let promoted = results
        .iter()
        .filter(|r| matches!(r, Ok(o) if o.promoted))
        .count();
    let late = results
        .iter()
        .filter(|r| matches!(r, Err(EdictError::NotPending { .. })))
        .count();
    assert_eq!(promoted, 1);
    assert_eq!(late, 1);
}

#[test]
fn test_audit_trail_records_votes_in_order() {
    let controller = controller();
    let id = pending_rule(&controller);
    controller
        .rules()
        .vote(&id, "bob", ApprovalDecision::Approved, None)
        .unwrap();
    controller
        .rules()
        .vote(&id, "alice", ApprovalDecision::Approved, None)
        .unwrap();

    let trail: Vec<_> = controller
        .audit_trail(&id)
        .unwrap()
        .into_iter()
        .map(|e| (e.action, e.actor))
        .collect();
    assert_eq!(
        trail,
        vec![
            ("created".to_string(), "author".to_string()),
            ("submitted".to_string(), "author".to_string()),
            ("voted".to_string(), "bob".to_string()),
            ("voted".to_string(), "alice".to_string()),
            ("approved".to_string(), "alice".to_string()),
        ]
    );
}

//! Drift reports, enforcement outcomes, exceptions and config versions

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};

use edictflow_core::directory::{StaticDirectory, Team};
use edictflow_core::engine::{Controller, NewException, RecordingDispatcher, SYSTEM_ACTOR};
use edictflow_core::model::{
    ApprovalDecision, Category, ChangeStatus, EnforcementMode, ExceptionStatus, ExceptionType,
    NewChangeReport, NewRule, TargetLayer,
};
use edictflow_core::protocol::Message;
use edictflow_core::{Clock, EdictError, ManualClock};

struct Harness {
    controller: Controller,
    clock: ManualClock,
    dispatcher: Arc<RecordingDispatcher>,
}

fn harness() -> Harness {
    let directory = StaticDirectory::new()
        .with_team(Team::new("web").inheriting_global())
        .with_team(Team::new("data"))
        .with_member("dev", "web")
        .with_member("analyst", "data")
        .with_permission("lead", "*");
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap());
    let dispatcher = Arc::new(RecordingDispatcher::new());
    let controller = Controller::builder()
        .directory(Arc::new(directory))
        .clock(Arc::new(clock.clone()))
        .dispatcher(dispatcher.clone())
        .build();

    controller.register_agent("agent-1", "dev", Some("laptop".into())).unwrap();
    dispatcher.connect("agent-1");
    Harness {
        controller,
        clock,
        dispatcher,
    }
}

fn approved_rule(controller: &Controller, mode: EnforcementMode, timeout_hours: u32) -> String {
    let mut input = NewRule::new("Guarded", "Do not edit this block.", TargetLayer::Organization);
    input.enforcement_mode = mode;
    input.temporary_timeout_hours = timeout_hours;
    let rule = controller.rules().create(input, "admin").unwrap();
    controller.rules().submit(&rule.id, "admin").unwrap();
    controller
        .rules()
        .vote(&rule.id, "lead", ApprovalDecision::Approved, None)
        .unwrap();
    rule.id
}

fn report(rule_id: &str, modified: &str, mode: EnforcementMode) -> NewChangeReport {
    NewChangeReport {
        rule_id: rule_id.to_string(),
        agent_id: "agent-1".into(),
        user_id: "dev".into(),
        team_id: Some("web".into()),
        file_path: "/work/app/CLAUDE.md".into(),
        original_hash: "aaaa".into(),
        modified_hash: modified.to_string(),
        diff: "+ local edit".into(),
        enforcement_mode: mode,
    }
}

#[test]
fn test_repeated_reports_collapse_into_one_pending_request() {
    let h = harness();
    let rule_id = approved_rule(&h.controller, EnforcementMode::Block, 0);
    let changes = h.controller.changes();

    let first = changes.report(report(&rule_id, "bbbb", EnforcementMode::Block)).unwrap();
    assert!(first.created);
    let second = changes.report(report(&rule_id, "cccc", EnforcementMode::Block)).unwrap();
    assert!(!second.created);
    assert_eq!(first.change.id, second.change.id);

    let pending = changes.list(Some(ChangeStatus::Pending)).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].modified_hash, "cccc");
    assert_eq!(pending[0].original_hash, "aaaa");
    assert!(pending[0].timeout_at.is_none());
}

#[test]
fn test_report_requires_known_rule_and_agent() {
    let h = harness();
    let rule_id = approved_rule(&h.controller, EnforcementMode::Block, 0);
    let changes = h.controller.changes();

    assert!(matches!(
        changes.report(report("missing", "bbbb", EnforcementMode::Block)),
        Err(EdictError::RuleNotFound { .. })
    ));
    let mut stranger = report(&rule_id, "bbbb", EnforcementMode::Block);
    stranger.agent_id = "agent-9".into();
    assert!(matches!(
        changes.report(stranger),
        Err(EdictError::AgentNotFound { .. })
    ));
}

#[test]
fn test_reject_pushes_revert_to_original_hash() {
    let h = harness();
    let rule_id = approved_rule(&h.controller, EnforcementMode::Block, 0);
    let change = h
        .controller
        .changes()
        .report(report(&rule_id, "bbbb", EnforcementMode::Block))
        .unwrap()
        .change;
    h.dispatcher.clear();

    assert!(matches!(
        h.controller.changes().reject(&change.id, "dev"),
        Err(EdictError::NoPermission { .. })
    ));

    let rejected = h.controller.changes().reject(&change.id, "lead").unwrap();
    assert_eq!(rejected.status, ChangeStatus::Rejected);
    assert_eq!(rejected.resolved_by.as_deref(), Some("lead"));

    let sent = h.dispatcher.sent_to("agent-1");
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        Message::ChangeRejected(p) => {
            assert_eq!(p.change_id, change.id);
            assert_eq!(p.revert_to_hash, "aaaa");
            assert!(!p.auto_reverted);
        }
        other => panic!("expected change_rejected, got {:?}", other),
    }

    // Resolved requests stay resolved
    assert!(matches!(
        h.controller.changes().approve(&change.id, "lead"),
        Err(EdictError::InvalidState { .. })
    ));

    // A new report for the same file opens a fresh request
    let reopened = h
        .controller
        .changes()
        .report(report(&rule_id, "dddd", EnforcementMode::Block))
        .unwrap();
    assert!(reopened.created);
    assert_ne!(reopened.change.id, change.id);
}

#[test]
fn test_approve_notifies_agent() {
    let h = harness();
    let rule_id = approved_rule(&h.controller, EnforcementMode::Block, 0);
    let change = h
        .controller
        .changes()
        .report(report(&rule_id, "bbbb", EnforcementMode::Block))
        .unwrap()
        .change;
    h.dispatcher.clear();

    h.controller.changes().approve(&change.id, "lead").unwrap();
    assert!(matches!(
        h.dispatcher.sent_to("agent-1").as_slice(),
        [Message::ChangeApproved(p)] if p.change_id == change.id
    ));
}

#[test]
fn test_temporary_change_auto_reverts_after_window() {
    let h = harness();
    let rule_id = approved_rule(&h.controller, EnforcementMode::Temporary, 2);
    let change = h
        .controller
        .changes()
        .report(report(&rule_id, "bbbb", EnforcementMode::Temporary))
        .unwrap()
        .change;
    assert_eq!(change.timeout_at, Some(h.clock.now() + Duration::hours(2)));
    h.dispatcher.clear();

    h.clock.advance(Duration::minutes(90));
    assert!(h.controller.changes().sweep_expired().unwrap().is_empty());

    h.clock.advance(Duration::minutes(31));
    let reverted = h.controller.changes().sweep_expired().unwrap();
    assert_eq!(reverted.len(), 1);
    assert_eq!(reverted[0].status, ChangeStatus::AutoReverted);
    assert_eq!(reverted[0].resolved_by.as_deref(), Some(SYSTEM_ACTOR));

    match h.dispatcher.sent_to("agent-1").as_slice() {
        [Message::ChangeRejected(p)] => {
            assert!(p.auto_reverted);
            assert_eq!(p.revert_to_hash, "aaaa");
        }
        other => panic!("expected one auto-revert, got {:?}", other),
    }

    // A second sweep finds nothing left
    assert!(h.controller.changes().sweep_expired().unwrap().is_empty());
}

#[test]
fn test_temporary_report_without_rule_window_uses_default_timeout() {
    let h = harness();
    // The agent reports temporary for a rule that carries no window of its own
    let rule_id = approved_rule(&h.controller, EnforcementMode::Block, 0);
    let start = h.clock.now();
    let change = h
        .controller
        .changes()
        .report(report(&rule_id, "bbbb", EnforcementMode::Temporary))
        .unwrap()
        .change;
    assert_eq!(change.timeout_at, Some(start + Duration::hours(24)));
}

#[test]
fn test_block_changes_never_time_out() {
    let h = harness();
    let rule_id = approved_rule(&h.controller, EnforcementMode::Block, 1);
    h.controller
        .changes()
        .report(report(&rule_id, "bbbb", EnforcementMode::Block))
        .unwrap();

    h.clock.advance(Duration::days(30));
    assert!(h.controller.changes().sweep_expired().unwrap().is_empty());
    assert_eq!(
        h.controller.changes().list(Some(ChangeStatus::Pending)).unwrap().len(),
        1
    );
}

#[test]
fn test_exception_lifecycle() {
    let h = harness();
    let rule_id = approved_rule(&h.controller, EnforcementMode::Block, 0);
    let change = h
        .controller
        .changes()
        .report(report(&rule_id, "bbbb", EnforcementMode::Block))
        .unwrap()
        .change;
    let exceptions = h.controller.exceptions();

    let request = |change_id: &str| NewException {
        change_id: change_id.to_string(),
        user_id: "dev".into(),
        justification: "Hotfix needs a local override".into(),
        exception_type: ExceptionType::TimeLimited,
        duration_hours: Some(4),
    };

    // Only refused changes can be waived
    assert!(matches!(
        exceptions.request(request(&change.id)),
        Err(EdictError::NotRejected { .. })
    ));

    h.controller.changes().reject(&change.id, "lead").unwrap();
    let exception = exceptions.request(request(&change.id)).unwrap();
    assert_eq!(exception.status, ExceptionStatus::Pending);
    assert!(!exceptions
        .has_active_exception("dev", &rule_id, "/work/app/CLAUDE.md")
        .unwrap());
    h.dispatcher.clear();

    let approved = exceptions.approve(&exception.id, "lead").unwrap();
    assert_eq!(approved.status, ExceptionStatus::Approved);
    assert_eq!(
        approved.expires_at,
        Some(h.clock.now() + Duration::hours(4))
    );
    assert_eq!(
        h.controller.changes().get(&change.id).unwrap().status,
        ChangeStatus::ExceptionGranted
    );
    assert!(matches!(
        h.dispatcher.sent_to("agent-1").as_slice(),
        [Message::ExceptionGranted(p)] if p.exception_id == exception.id
    ));

    assert!(exceptions
        .has_active_exception("dev", &rule_id, "/work/app/CLAUDE.md")
        .unwrap());
    assert!(!exceptions
        .has_active_exception("dev", &rule_id, "/work/other/CLAUDE.md")
        .unwrap());

    h.clock.advance(Duration::hours(5));
    assert!(!exceptions
        .has_active_exception("dev", &rule_id, "/work/app/CLAUDE.md")
        .unwrap());

    assert!(matches!(
        exceptions.deny(&exception.id, "lead"),
        Err(EdictError::InvalidState { .. })
    ));
}

#[test]
fn test_exception_validation_and_denial() {
    let h = harness();
    let rule_id = approved_rule(&h.controller, EnforcementMode::Temporary, 1);
    let change = h
        .controller
        .changes()
        .report(report(&rule_id, "bbbb", EnforcementMode::Temporary))
        .unwrap()
        .change;
    h.clock.advance(Duration::hours(2));
    h.controller.changes().sweep_expired().unwrap();

    let exceptions = h.controller.exceptions();
    let missing_window = NewException {
        change_id: change.id.clone(),
        user_id: "dev".into(),
        justification: "needed".into(),
        exception_type: ExceptionType::TimeLimited,
        duration_hours: None,
    };
    assert!(matches!(
        exceptions.request(missing_window),
        Err(EdictError::Validation { .. })
    ));

    let permanent = exceptions
        .request(NewException {
            change_id: change.id.clone(),
            user_id: "dev".into(),
            justification: "generated file".into(),
            exception_type: ExceptionType::Permanent,
            duration_hours: Some(12),
        })
        .unwrap();
    assert_eq!(permanent.duration_hours, None);

    assert!(matches!(
        exceptions.deny(&permanent.id, "dev"),
        Err(EdictError::NoPermission { .. })
    ));
    h.dispatcher.clear();
    let denied = exceptions.deny(&permanent.id, "lead").unwrap();
    assert_eq!(denied.status, ExceptionStatus::Denied);
    assert!(matches!(
        h.dispatcher.sent_to("agent-1").as_slice(),
        [Message::ExceptionDenied(_)]
    ));
    assert_eq!(
        h.controller.changes().get(&change.id).unwrap().status,
        ChangeStatus::AutoReverted
    );
}

#[test]
fn test_config_version_reused_until_content_changes() {
    let h = harness();
    let distribution = h.controller.distribution();

    let empty = distribution.config_for_agent("agent-1").unwrap();
    assert!(empty.rules.is_empty());
    let again = distribution.config_for_agent("agent-1").unwrap();
    assert_eq!(empty.version, again.version);

    approved_rule(&h.controller, EnforcementMode::Block, 0);
    let with_rule = distribution.config_for_agent("agent-1").unwrap();
    assert_eq!(with_rule.rules.len(), 1);
    assert!(with_rule.version > again.version);

    // Category changes alter the rendered content
    h.controller
        .rules()
        .upsert_category(Category::new("sec", "Security", 1), "admin")
        .unwrap();
    let with_category = distribution.config_for_agent("agent-1").unwrap();
    assert!(with_category.version > with_rule.version);
    assert_eq!(
        distribution.config_for_agent("agent-1").unwrap().version,
        with_category.version
    );
}

#[test]
fn test_cohorts_see_different_effective_sets() {
    let h = harness();
    h.controller.register_agent("agent-2", "analyst", None).unwrap();

    // Approved organization rules reach inheriting teams only
    approved_rule(&h.controller, EnforcementMode::Advisory, 0);
    let mut forced = NewRule::new("Forced", "Applies everywhere.", TargetLayer::Enterprise);
    forced.force = true;
    let forced = h.controller.rules().create(forced, "admin").unwrap();
    h.controller.rules().submit(&forced.id, "admin").unwrap();
    h.controller
        .rules()
        .vote(&forced.id, "lead", ApprovalDecision::Approved, None)
        .unwrap();

    let web = h.controller.distribution().config_for_agent("agent-1").unwrap();
    let data = h.controller.distribution().config_for_agent("agent-2").unwrap();
    assert_eq!(web.rules.len(), 2);
    assert_eq!(data.rules.len(), 1);
    assert_eq!(data.rules[0].id, forced.id);
}

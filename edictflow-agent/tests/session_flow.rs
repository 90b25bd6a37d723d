//! Session client against an in-memory controller

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use edictflow_agent::config::{BackoffConfig, QueueConfig};
use edictflow_agent::notifier::{NotificationKind, RecordingNotifier};
use edictflow_agent::store::{AuthRecord, LocalChangeStatus};
use edictflow_agent::transport::{MemoryListener, MemoryPeer};
use edictflow_agent::{
    AgentStore, MemoryConnector, OutboundQueue, Reconciler, SessionClient, SessionParts, SessionStatus,
};
use edictflow_core::model::{EnforcementMode, ProjectContext, TargetLayer};
use edictflow_core::protocol::{
    AckPayload, ChangeRejectedPayload, ConfigUpdatePayload, Envelope, Message, RuleRecord,
    SyncCompletePayload, SyncRequestPayload,
};
use edictflow_core::{Clock, SystemClock};
use tokio_util::sync::CancellationToken;

struct Agent {
    store: Arc<AgentStore>,
    queue: Arc<OutboundQueue>,
    reconciler: Arc<Reconciler>,
    notifier: Arc<RecordingNotifier>,
    status: Arc<SessionStatus>,
    listener: MemoryListener,
    connector: Arc<MemoryConnector>,
    cancel: CancellationToken,
    project: tempfile::TempDir,
}

impl Agent {
    fn new() -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = Arc::new(AgentStore::open_in_memory().unwrap());
        store
            .save_auth(
                &AuthRecord {
                    token: "tok".into(),
                    expires_at: None,
                    user_id: "dev".into(),
                    agent_id: "agent-1".into(),
                },
                Utc::now(),
            )
            .unwrap();
        let project = tempfile::tempdir().unwrap();
        store
            .upsert_project(
                &ProjectContext {
                    path: project.path().to_string_lossy().into_owned(),
                    context_types: vec![],
                    tags: vec![],
                },
                Utc::now(),
            )
            .unwrap();

        let queue_config = QueueConfig {
            resend_after_secs: 5,
            ..QueueConfig::default()
        };
        let queue = Arc::new(OutboundQueue::new(store.clone(), queue_config, clock.clone()));
        let notifier = Arc::new(RecordingNotifier::new());
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            queue.clone(),
            notifier.clone(),
            clock,
            "CLAUDE.md",
        ));
        let (connector, listener) = MemoryConnector::pair();
        Self {
            store,
            queue,
            reconciler,
            notifier,
            status: Arc::new(SessionStatus::new()),
            listener,
            connector: Arc::new(connector),
            cancel: CancellationToken::new(),
            project,
        }
    }

    fn managed_file(&self) -> PathBuf {
        self.project.path().join("CLAUDE.md")
    }

    fn start(&self) -> tokio::task::JoinHandle<edictflow_agent::Result<()>> {
        let client = SessionClient::new(
            self.connector.clone(),
            SessionParts {
                store: self.store.clone(),
                queue: self.queue.clone(),
                reconciler: self.reconciler.clone(),
                notifier: self.notifier.clone(),
                clock: Arc::new(SystemClock),
                status: self.status.clone(),
            },
            Duration::from_secs(3600),
            BackoffConfig {
                initial_secs: 1,
                max_secs: 4,
            },
        );
        let cancel = self.cancel.clone();
        tokio::spawn(async move { client.run(cancel).await })
    }
}

async fn accept(listener: &mut MemoryListener) -> MemoryPeer {
    tokio::time::timeout(Duration::from_secs(30), listener.accept())
        .await
        .expect("agent never connected")
        .expect("connector dropped")
}

async fn next_envelope(peer: &mut MemoryPeer) -> Envelope {
    let text = tokio::time::timeout(Duration::from_secs(30), peer.from_agent.recv())
        .await
        .expect("no frame from agent")
        .expect("agent closed the link");
    Envelope::decode(&text).unwrap()
}

async fn send(peer: &MemoryPeer, message: Message) {
    let frame = Envelope::new(message).unwrap().encode().unwrap();
    peer.to_agent.send(frame).await.unwrap();
}

fn block_rule() -> RuleRecord {
    RuleRecord {
        id: "r1".into(),
        name: "No secrets".into(),
        body: "Never commit credentials.".into(),
        target_layer: TargetLayer::Organization,
        triggers: vec![],
        enforcement_mode: EnforcementMode::Block,
        temporary_timeout_hours: 0,
        priority_weight: 0,
        overridable: false,
        force: false,
        category_id: None,
        effective_start: None,
        effective_end: None,
    }
}

#[tokio::test]
async fn test_config_drift_reject_round_trip() {
    let mut agent = Agent::new();
    let session = agent.start();
    let mut peer = accept(&mut agent.listener).await;
    assert_eq!(peer.token, "tok");

    let hello = next_envelope(&mut peer).await;
    match hello.message().unwrap() {
        Some(Message::Heartbeat(hb)) => {
            assert_eq!(hb.cached_version, 0);
            assert_eq!(hb.active_projects.len(), 1);
        }
        other => panic!("expected heartbeat, got {:?}", other),
    }

    send(
        &peer,
        Message::ConfigUpdate(ConfigUpdatePayload {
            rules: vec![block_rule()],
            categories: vec![],
            version: 7,
        }),
    )
    .await;

    let synced = next_envelope(&mut peer).await;
    assert_eq!(
        synced.message().unwrap(),
        Some(Message::SyncComplete(SyncCompletePayload {
            version: 7,
            files_written: 1
        }))
    );
    send(&peer, Message::Ack(AckPayload::ok(synced.ref_id()))).await;

    let path = agent.managed_file();
    let rendered = std::fs::read_to_string(&path).unwrap();
    assert!(rendered.contains("Never commit credentials."));
    assert_eq!(agent.store.cached_version().unwrap(), 7);

    // Tamper and feed the event the watcher would deliver
    std::fs::write(&path, rendered.replace("Never commit", "Feel free to commit")).unwrap();
    agent.reconciler.on_file_event(&path).unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap(), rendered);

    let report = next_envelope(&mut peer).await;
    let detected = match report.message().unwrap() {
        Some(Message::ChangeDetected(p)) => p,
        other => panic!("expected change_detected, got {:?}", other),
    };
    assert_eq!(detected.rule_id, "r1");
    assert_eq!(detected.enforcement_mode, EnforcementMode::Block);
    assert!(detected.diff.contains("-Never commit credentials."));
    assert!(detected.diff.contains("+Feel free to commit credentials."));
    send(
        &peer,
        Message::Ack(AckPayload {
            ref_id: report.ref_id().to_string(),
            entity_id: Some("chg-1".into()),
            error: None,
        }),
    )
    .await;

    send(
        &peer,
        Message::ChangeRejected(ChangeRejectedPayload {
            change_id: "chg-1".into(),
            rule_id: "r1".into(),
            revert_to_hash: detected.original_hash.clone(),
            file_path: Some(detected.file_path.clone()),
            auto_reverted: false,
        }),
    )
    .await;

    let reverted = next_envelope(&mut peer).await;
    match reverted.message().unwrap() {
        Some(Message::RevertComplete(p)) => {
            assert_eq!(p.change_id.as_deref(), Some("chg-1"));
            assert_eq!(p.new_hash, detected.original_hash);
        }
        other => panic!("expected revert_complete, got {:?}", other),
    }
    let row = agent.store.change_by_id("chg-1").unwrap().unwrap();
    assert_eq!(row.status, LocalChangeStatus::Rejected);
    assert!(agent.notifier.kinds().contains(&NotificationKind::ChangeRejected));

    // Acked entries are gone; the revert is still outstanding
    assert_eq!(agent.queue.len().unwrap(), 1);

    agent.cancel.cancel();
    session.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unacked_entries_replay_after_reconnect() {
    let mut agent = Agent::new();
    let ref_id = agent
        .queue
        .enqueue(Message::SyncComplete(SyncCompletePayload {
            version: 1,
            files_written: 0,
        }))
        .unwrap();
    agent.connector.refuse_next(2);
    let session = agent.start();

    let mut peer = accept(&mut agent.listener).await;
    assert!(matches!(next_envelope(&mut peer).await.message().unwrap(), Some(Message::Heartbeat(_))));
    assert_eq!(next_envelope(&mut peer).await.ref_id(), ref_id);
    assert!(agent.status.is_connected());

    drop(peer);
    let mut peer = accept(&mut agent.listener).await;
    assert!(matches!(next_envelope(&mut peer).await.message().unwrap(), Some(Message::Heartbeat(_))));
    let replayed = next_envelope(&mut peer).await;
    assert_eq!(replayed.ref_id(), ref_id);

    send(&peer, Message::Ack(AckPayload::ok(ref_id.clone()))).await;
    send(&peer, Message::SyncRequest(SyncRequestPayload { reason: None })).await;
    // A sync request answers with a heartbeat, then a drift report
    assert!(matches!(next_envelope(&mut peer).await.message().unwrap(), Some(Message::Heartbeat(_))));
    assert!(matches!(next_envelope(&mut peer).await.message().unwrap(), Some(Message::DriftReport(_))));
    assert_eq!(agent.queue.len().unwrap(), 1);

    let kinds = agent.notifier.kinds();
    assert!(kinds.contains(&NotificationKind::ConnectionLost));
    assert!(kinds.contains(&NotificationKind::ConnectionRestored));

    agent.cancel.cancel();
    session.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unacked_entry_is_resent_on_the_same_link() {
    let mut agent = Agent::new();
    let ref_id = agent
        .queue
        .enqueue(Message::SyncComplete(SyncCompletePayload {
            version: 3,
            files_written: 0,
        }))
        .unwrap();
    let session = agent.start();

    let mut peer = accept(&mut agent.listener).await;
    assert!(matches!(next_envelope(&mut peer).await.message().unwrap(), Some(Message::Heartbeat(_))));
    let first = next_envelope(&mut peer).await;
    assert_eq!(first.ref_id(), ref_id);

    // No ack: the entry comes back after the resend interval without a reconnect
    let started = tokio::time::Instant::now();
    let second = next_envelope(&mut peer).await;
    assert_eq!(second.ref_id(), ref_id);
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert!(agent.status.is_connected());

    send(&peer, Message::Ack(AckPayload::ok(ref_id.clone()))).await;
    send(&peer, Message::SyncRequest(SyncRequestPayload { reason: None })).await;
    assert!(matches!(next_envelope(&mut peer).await.message().unwrap(), Some(Message::Heartbeat(_))));
    assert!(matches!(next_envelope(&mut peer).await.message().unwrap(), Some(Message::DriftReport(_))));
    // Only the drift report is outstanding
    assert_eq!(agent.queue.len().unwrap(), 1);

    agent.cancel.cancel();
    session.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_missing_credential_is_fatal() {
    let agent = Agent::new();
    agent.store.clear_auth().unwrap();
    let err = agent.start().await.unwrap().unwrap_err();
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_unknown_frames_are_dropped() {
    let mut agent = Agent::new();
    let session = agent.start();
    let mut peer = accept(&mut agent.listener).await;
    next_envelope(&mut peer).await;

    peer.to_agent
        .send(r#"{"type":"future_thing","id":"x","timestamp":"2026-01-01T00:00:00Z","payload":{}}"#.into())
        .await
        .unwrap();
    peer.to_agent.send("not json".into()).await.unwrap();
    send(
        &peer,
        Message::ConfigUpdate(ConfigUpdatePayload {
            rules: vec![],
            categories: vec![],
            version: 2,
        }),
    )
    .await;
    assert!(matches!(next_envelope(&mut peer).await.message().unwrap(), Some(Message::SyncComplete(_))));

    agent.cancel.cancel();
    session.await.unwrap().unwrap();
}

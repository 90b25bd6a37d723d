//! End-to-end sessions over a real socket

use std::sync::Arc;
use std::time::Duration;

use edictflow_core::directory::{StaticDirectory, Team};
use edictflow_core::engine::Controller;
use edictflow_core::model::{ApprovalDecision, EnforcementMode, NewRule, TargetLayer};
use edictflow_core::protocol::{
    AgentStatus, ChangeDetectedPayload, Envelope, HeartbeatPayload, Message,
};
use edictflow_server::auth::{Identity, StaticTokens};
use edictflow_server::{AppState, ControllerServer, ServerConfig};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Running {
    server: Arc<ControllerServer>,
    url: String,
    stop: Option<tokio::sync::oneshot::Sender<()>>,
}

impl Drop for Running {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

async fn start() -> Running {
    let directory = StaticDirectory::new()
        .with_team(Team::new("web").inheriting_global())
        .with_member("dev", "web")
        .with_permission("lead", "*");
    let tokens = StaticTokens::new().with_token("agent-token", Identity::agent("dev", "agent-1"));
    let server = Arc::new(ControllerServer::new(AppState::new(
        ServerConfig::default(),
        Controller::builder().directory(Arc::new(directory)),
        Arc::new(tokens),
    )));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/api/v1/ws", listener.local_addr().unwrap());
    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving
            .serve(listener, async {
                let _ = stopped.await;
            })
            .await;
    });

    Running {
        server,
        url,
        stop: Some(stop),
    }
}

async fn connect(url: &str, token: &str) -> Client {
    let mut request = url.into_client_request().unwrap();
    request.headers_mut().insert(
        "authorization",
        HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
    );
    let (client, _) = tokio_tungstenite::connect_async(request).await.unwrap();
    client
}

async fn send(client: &mut Client, envelope: Envelope) {
    client
        .send(WsMessage::Text(envelope.encode().unwrap()))
        .await
        .unwrap();
}

/// Next decoded controller message, skipping control frames
async fn next_message(client: &mut Client) -> Message {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("session closed")
            .unwrap();
        if let WsMessage::Text(text) = frame {
            return Envelope::decode(&text).unwrap().message().unwrap().unwrap();
        }
    }
}

async fn wait_for_session(server: &ControllerServer, agent_id: &str) {
    for _ in 0..100 {
        if server.state().registry.is_connected(agent_id) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session for {} never registered", agent_id);
}

fn approve_rule(controller: &Controller, mode: EnforcementMode) -> String {
    let mut input = NewRule::new("Guarded", "Keep this block.", TargetLayer::Organization);
    input.enforcement_mode = mode;
    let rule = controller.rules().create(input, "admin").unwrap();
    controller.rules().submit(&rule.id, "admin").unwrap();
    controller
        .rules()
        .vote(&rule.id, "lead", ApprovalDecision::Approved, None)
        .unwrap();
    rule.id
}

fn heartbeat(version: u64) -> Envelope {
    Envelope::new(Message::Heartbeat(HeartbeatPayload {
        status: AgentStatus::Online,
        cached_version: version,
        active_projects: vec!["/work/app".into()],
        hostname: None,
        agent_version: None,
    }))
    .unwrap()
}

#[tokio::test]
async fn test_handshake_rejects_unknown_credential() {
    let running = start().await;
    let mut request = running.url.as_str().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("authorization", HeaderValue::from_static("Bearer forged"));
    assert!(tokio_tungstenite::connect_async(request).await.is_err());
}

#[tokio::test]
async fn test_heartbeat_change_and_resolution_round_trip() {
    let running = start().await;
    let controller = running.server.state().controller.clone();
    let rule_id = approve_rule(&controller, EnforcementMode::Block);

    let mut client = connect(&running.url, "agent-token").await;
    send(&mut client, heartbeat(0)).await;
    let version = match next_message(&mut client).await {
        Message::ConfigUpdate(config) => {
            assert_eq!(config.rules.len(), 1);
            config.version
        }
        other => panic!("expected config_update, got {:?}", other),
    };
    assert!(version >= 1);

    let detected = Envelope::with_ref_id(
        "ref-1",
        Message::ChangeDetected(ChangeDetectedPayload {
            rule_id: rule_id.clone(),
            file_path: "/work/app/CLAUDE.md".into(),
            original_hash: "aaaa".into(),
            modified_hash: "bbbb".into(),
            diff: "+ edit".into(),
            enforcement_mode: EnforcementMode::Block,
        }),
    )
    .unwrap();
    send(&mut client, detected).await;
    let change_id = match next_message(&mut client).await {
        Message::Ack(ack) => {
            assert_eq!(ack.ref_id, "ref-1");
            ack.entity_id.unwrap()
        }
        other => panic!("expected ack, got {:?}", other),
    };

    controller.changes().reject(&change_id, "lead").unwrap();
    match next_message(&mut client).await {
        Message::ChangeRejected(p) => {
            assert_eq!(p.change_id, change_id);
            assert_eq!(p.revert_to_hash, "aaaa");
        }
        other => panic!("expected change_rejected, got {:?}", other),
    }
}

#[tokio::test]
async fn test_approval_broadcasts_to_live_sessions() {
    let running = start().await;
    let mut client = connect(&running.url, "agent-token").await;
    wait_for_session(&running.server, "agent-1").await;

    approve_rule(&running.server.state().controller, EnforcementMode::Advisory);
    match next_message(&mut client).await {
        Message::ConfigUpdate(config) => assert_eq!(config.rules.len(), 1),
        other => panic!("expected config_update, got {:?}", other),
    }
}

#[tokio::test]
async fn test_new_handshake_supersedes_old_session() {
    let running = start().await;
    let mut first = connect(&running.url, "agent-token").await;
    wait_for_session(&running.server, "agent-1").await;
    let mut second = connect(&running.url, "agent-token").await;

    // The superseded socket is closed by the controller
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match first.next().await {
                None | Some(Err(_)) | Some(Ok(WsMessage::Close(_))) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok());

    // The replacement still works
    send(&mut second, heartbeat(0)).await;
    assert!(matches!(
        next_message(&mut second).await,
        Message::ConfigUpdate(_)
    ));
    assert_eq!(running.server.state().registry.len(), 1);
}

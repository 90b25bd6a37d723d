//! One WebSocket session per connected agent
//!
//! The writer drains the session's outbound buffer under a per-frame write
//! deadline and pings on a fixed period. The reader decodes envelopes,
//! dispatches them to the handlers and queues replies on the same buffer.
//! Either side failing cancels the session; the registry entry is removed
//! only if it still belongs to this session.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use edictflow_core::protocol::Envelope;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::auth::Identity;
use crate::handlers::{handle_envelope, SessionContext};
use crate::AppState;

/// Drive a session until the socket closes, a deadline passes or the
/// session is superseded
pub async fn run_session(socket: WebSocket, identity: Identity, agent_id: String, state: Arc<AppState>) {
    if let Err(e) = state.controller.register_agent(&agent_id, &identity.user_id, None) {
        tracing::error!(agent_id = %agent_id, error = %e, "failed to register agent");
        return;
    }

    let lease = state.registry.register(&agent_id, &state.shutdown);
    tracing::info!(agent_id = %agent_id, session = lease.session_id, "session opened");

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_loop(
        sink,
        lease.outbound,
        lease.cancel.clone(),
        state.config.write_timeout,
        state.config.ping_interval,
    ));

    let ctx = SessionContext {
        agent_id: agent_id.clone(),
        user_id: identity.user_id,
    };
    read_loop(stream, &ctx, &state, &lease.replies, &lease.cancel).await;

    lease.cancel.cancel();
    if let Err(e) = writer.await {
        tracing::warn!(agent_id = %agent_id, error = %e, "session writer panicked");
    }
    state.registry.unregister(&agent_id, lease.session_id);
    tracing::info!(agent_id = %agent_id, session = lease.session_id, "session closed");
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut outbound: mpsc::Receiver<Envelope>,
    cancel: CancellationToken,
    write_timeout: Duration,
    ping_interval: Duration,
) {
    let mut ping = tokio::time::interval(ping_interval);
    // The first tick completes immediately
    ping.tick().await;

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = tokio::time::timeout(write_timeout, sink.send(WsMessage::Close(None))).await;
                break;
            }
            envelope = outbound.recv() => {
                let Some(envelope) = envelope else { break };
                match envelope.encode() {
                    Ok(text) => WsMessage::Text(text),
                    Err(e) => {
                        tracing::error!(error = %e, "failed to encode envelope; dropped");
                        continue;
                    }
                }
            }
            _ = ping.tick() => WsMessage::Ping(Vec::new()),
        };

        match tokio::time::timeout(write_timeout, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "session write failed");
                break;
            }
            Err(_) => {
                tracing::warn!("session write deadline exceeded");
                break;
            }
        }
    }
    cancel.cancel();
}

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    ctx: &SessionContext,
    state: &AppState,
    replies: &mpsc::Sender<Envelope>,
    cancel: &CancellationToken,
) {
    let read_timeout = state.config.read_timeout();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = tokio::time::timeout(read_timeout, stream.next()) => next,
        };
        let frame = match next {
            Err(_) => {
                tracing::warn!(agent_id = %ctx.agent_id, "read deadline passed; closing");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                tracing::debug!(agent_id = %ctx.agent_id, error = %e, "session read failed");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        let text = match frame {
            WsMessage::Text(text) => text,
            WsMessage::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    tracing::warn!(agent_id = %ctx.agent_id, "non-UTF-8 binary frame dropped");
                    continue;
                }
            },
            WsMessage::Close(_) => break,
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
        };

        let envelope = match Envelope::decode(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(agent_id = %ctx.agent_id, error = %e, "undecodable frame dropped");
                continue;
            }
        };

        // Store calls may block on SQLite
        let controller = state.controller.clone();
        let session = ctx.clone();
        let outcome =
            tokio::task::spawn_blocking(move || handle_envelope(&controller, &session, &envelope)).await;
        let replies_out = match outcome {
            Ok(out) => out,
            Err(e) => {
                tracing::error!(agent_id = %ctx.agent_id, error = %e, "frame handler panicked");
                continue;
            }
        };

        for reply in replies_out {
            let kind = reply.message_type();
            let queued = Envelope::new(reply).map(|env| replies.try_send(env).is_ok());
            if !matches!(queued, Ok(true)) {
                tracing::warn!(agent_id = %ctx.agent_id, message = %kind, "reply dropped");
            }
        }
    }
}

//! Session handshake

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;

use crate::error::Result;
use crate::session::run_session;
use crate::AppState;

/// Authenticate the bearer credential, then upgrade to a session
///
/// Credentials without a bound agent id use the user id as the agent id.
pub async fn upgrade(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response> {
    let identity = state.identify(&headers)?;
    let agent_id = identity
        .agent_id
        .clone()
        .unwrap_or_else(|| identity.user_id.clone());
    tracing::debug!(agent_id = %agent_id, user_id = %identity.user_id, "session handshake");

    Ok(ws.on_upgrade(move |socket| run_session(socket, identity, agent_id, state)))
}

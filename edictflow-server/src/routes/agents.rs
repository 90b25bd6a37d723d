//! Agent registry routes

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Json;
use edictflow_core::engine::Dispatcher;
use edictflow_core::model::AgentRecord;
use edictflow_core::protocol::{ConfigUpdatePayload, Message, SyncRequestPayload};
use serde::Serialize;

use crate::error::Result;
use crate::AppState;

/// Registry record plus live-session flag
#[derive(Debug, Serialize)]
pub struct AgentView {
    #[serde(flatten)]
    pub agent: AgentRecord,
    pub connected: bool,
}

#[derive(Debug, Serialize)]
pub struct SyncResponse {
    pub agent_id: String,
    pub delivered: bool,
}

pub async fn list_agents(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<AgentView>>> {
    state.identify(&headers)?;
    let agents = state
        .controller
        .agents()?
        .into_iter()
        .map(|agent| AgentView {
            connected: state.registry.is_connected(&agent.agent_id),
            agent,
        })
        .collect();
    Ok(Json(agents))
}

/// The config the agent should hold right now
pub async fn agent_config(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(agent_id): Path<String>,
) -> Result<Json<ConfigUpdatePayload>> {
    state.identify(&headers)?;
    Ok(Json(
        state.controller.distribution().config_for_agent(&agent_id)?,
    ))
}

/// Ask a connected agent to heartbeat and reconcile
pub async fn request_sync(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(agent_id): Path<String>,
) -> Result<Json<SyncResponse>> {
    let caller = state.identify(&headers)?;
    let delivered = state.registry.dispatch(
        &agent_id,
        Message::SyncRequest(SyncRequestPayload {
            reason: Some(format!("requested by {}", caller.user_id)),
        }),
    );
    Ok(Json(SyncResponse { agent_id, delivered }))
}

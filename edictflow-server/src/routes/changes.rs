//! Change-request routes

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Json;
use edictflow_core::model::{ChangeRequest, ChangeStatus};
use serde::Deserialize;

use crate::error::Result;
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ChangeQuery {
    #[serde(default)]
    pub status: Option<ChangeStatus>,
}

pub async fn list_changes(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ChangeQuery>,
) -> Result<Json<Vec<ChangeRequest>>> {
    state.identify(&headers)?;
    Ok(Json(state.controller.changes().list(query.status)?))
}

pub async fn get_change(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(change_id): Path<String>,
) -> Result<Json<ChangeRequest>> {
    state.identify(&headers)?;
    Ok(Json(state.controller.changes().get(&change_id)?))
}

pub async fn approve_change(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(change_id): Path<String>,
) -> Result<Json<ChangeRequest>> {
    let caller = state.identify(&headers)?;
    Ok(Json(
        state.controller.changes().approve(&change_id, &caller.user_id)?,
    ))
}

pub async fn reject_change(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(change_id): Path<String>,
) -> Result<Json<ChangeRequest>> {
    let caller = state.identify(&headers)?;
    Ok(Json(
        state.controller.changes().reject(&change_id, &caller.user_id)?,
    ))
}

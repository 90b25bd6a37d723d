//! Exception-request routes

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use edictflow_core::engine::NewException;
use edictflow_core::model::{ExceptionRequest, ExceptionType};
use serde::Deserialize;

use crate::error::Result;
use crate::AppState;

/// Exception request body; the requester is the authenticated caller
#[derive(Debug, Deserialize)]
pub struct ExceptionBody {
    pub change_id: String,
    pub justification: String,
    pub exception_type: ExceptionType,
    #[serde(default)]
    pub duration_hours: Option<u32>,
}

pub async fn request_exception(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ExceptionBody>,
) -> Result<(StatusCode, Json<ExceptionRequest>)> {
    let caller = state.identify(&headers)?;
    let exception = state.controller.exceptions().request(NewException {
        change_id: body.change_id,
        user_id: caller.user_id,
        justification: body.justification,
        exception_type: body.exception_type,
        duration_hours: body.duration_hours,
    })?;
    Ok((StatusCode::CREATED, Json(exception)))
}

pub async fn list_exceptions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<ExceptionRequest>>> {
    state.identify(&headers)?;
    Ok(Json(state.controller.exceptions().list()?))
}

pub async fn get_exception(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(exception_id): Path<String>,
) -> Result<Json<ExceptionRequest>> {
    state.identify(&headers)?;
    Ok(Json(state.controller.exceptions().get(&exception_id)?))
}

pub async fn approve_exception(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(exception_id): Path<String>,
) -> Result<Json<ExceptionRequest>> {
    let caller = state.identify(&headers)?;
    Ok(Json(
        state
            .controller
            .exceptions()
            .approve(&exception_id, &caller.user_id)?,
    ))
}

pub async fn deny_exception(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(exception_id): Path<String>,
) -> Result<Json<ExceptionRequest>> {
    let caller = state.identify(&headers)?;
    Ok(Json(
        state
            .controller
            .exceptions()
            .deny(&exception_id, &caller.user_id)?,
    ))
}

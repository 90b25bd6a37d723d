//! Rule catalog, lifecycle and approval routes

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use edictflow_core::engine::{RuleFilter, Transition, VoteOutcome};
use edictflow_core::model::{
    ApprovalConfig, ApprovalDecision, ApprovalRecord, Category, NewRule, Rule, RuleAttachment,
    RulePatch,
};
use edictflow_core::AuditEvent;
use serde::Deserialize;

use crate::error::Result;
use crate::AppState;

/// Vote request
#[derive(Debug, Deserialize)]
pub struct VoteRequest {
    pub decision: ApprovalDecision,
    #[serde(default)]
    pub comment: Option<String>,
}

/// Attachment request
#[derive(Debug, Deserialize)]
pub struct AttachRequest {
    pub team_id: String,
}

pub async fn create_rule(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<NewRule>,
) -> Result<(StatusCode, Json<Rule>)> {
    let caller = state.identify(&headers)?;
    let rule = state.controller.rules().create(req, &caller.user_id)?;
    Ok((StatusCode::CREATED, Json(rule)))
}

pub async fn list_rules(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(filter): Query<RuleFilter>,
) -> Result<Json<Vec<Rule>>> {
    state.identify(&headers)?;
    Ok(Json(state.controller.rules().list(&filter)?))
}

pub async fn get_rule(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(rule_id): Path<String>,
) -> Result<Json<Rule>> {
    state.identify(&headers)?;
    Ok(Json(state.controller.rules().get(&rule_id)?))
}

pub async fn update_rule(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(rule_id): Path<String>,
    Json(patch): Json<RulePatch>,
) -> Result<Json<Rule>> {
    let caller = state.identify(&headers)?;
    Ok(Json(state.controller.rules().update(&rule_id, patch, &caller.user_id)?))
}

pub async fn delete_rule(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(rule_id): Path<String>,
) -> Result<StatusCode> {
    let caller = state.identify(&headers)?;
    state.controller.rules().delete(&rule_id, &caller.user_id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn submit_rule(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(rule_id): Path<String>,
) -> Result<Json<Transition>> {
    let caller = state.identify(&headers)?;
    Ok(Json(state.controller.rules().submit(&rule_id, &caller.user_id)?))
}

pub async fn resubmit_rule(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(rule_id): Path<String>,
) -> Result<Json<Transition>> {
    let caller = state.identify(&headers)?;
    Ok(Json(state.controller.rules().resubmit(&rule_id, &caller.user_id)?))
}

pub async fn reset_rule(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(rule_id): Path<String>,
) -> Result<Json<Transition>> {
    let caller = state.identify(&headers)?;
    Ok(Json(state.controller.rules().reset(&rule_id, &caller.user_id)?))
}

pub async fn vote(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(rule_id): Path<String>,
    Json(req): Json<VoteRequest>,
) -> Result<Json<VoteOutcome>> {
    let caller = state.identify(&headers)?;
    let outcome = state
        .controller
        .rules()
        .vote(&rule_id, &caller.user_id, req.decision, req.comment)?;
    Ok(Json(outcome))
}

pub async fn list_approvals(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(rule_id): Path<String>,
) -> Result<Json<Vec<ApprovalRecord>>> {
    state.identify(&headers)?;
    Ok(Json(state.controller.rules().approvals(&rule_id)?))
}

pub async fn attach(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(rule_id): Path<String>,
    Json(req): Json<AttachRequest>,
) -> Result<(StatusCode, Json<RuleAttachment>)> {
    let caller = state.identify(&headers)?;
    let attachment = state
        .controller
        .rules()
        .attach(&rule_id, &req.team_id, &caller.user_id)?;
    Ok((StatusCode::CREATED, Json(attachment)))
}

pub async fn approve_attachment(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((rule_id, team_id)): Path<(String, String)>,
) -> Result<StatusCode> {
    let caller = state.identify(&headers)?;
    state
        .controller
        .rules()
        .approve_attachment(&rule_id, &team_id, &caller.user_id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_attachments(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(rule_id): Path<String>,
) -> Result<Json<Vec<RuleAttachment>>> {
    state.identify(&headers)?;
    Ok(Json(state.controller.rules().attachments(&rule_id)?))
}

pub async fn audit_trail(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(rule_id): Path<String>,
) -> Result<Json<Vec<AuditEvent>>> {
    state.identify(&headers)?;
    Ok(Json(state.controller.audit_trail(&rule_id)?))
}

pub async fn list_categories(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<Category>>> {
    state.identify(&headers)?;
    Ok(Json(state.controller.rules().categories()?))
}

pub async fn upsert_category(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(category): Json<Category>,
) -> Result<Json<Category>> {
    let caller = state.identify(&headers)?;
    Ok(Json(
        state
            .controller
            .rules()
            .upsert_category(category, &caller.user_id)?,
    ))
}

pub async fn set_approval_config(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(config): Json<ApprovalConfig>,
) -> Result<StatusCode> {
    state.identify(&headers)?;
    state.controller.rules().set_approval_config(config)?;
    Ok(StatusCode::NO_CONTENT)
}

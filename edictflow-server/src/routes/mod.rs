//! HTTP route handlers

mod agents;
mod changes;
mod exceptions;
mod rules;
mod ws;

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub protocol: String,
    pub store: String,
    pub sessions: usize,
}

/// Health check endpoint
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let store = state.controller.store();
    let status = match store.health_check() {
        Ok(()) => "healthy",
        Err(e) => {
            tracing::warn!(error = %e, "store health check failed");
            "degraded"
        }
    };
    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        protocol: edictflow_core::PROTOCOL_VERSION.to_string(),
        store: store.name().to_string(),
        sessions: state.registry.len(),
    })
}

/// Create the router with all routes
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = state.config.cors_enabled;
    let router = Router::new()
        .route("/health", get(health))
        .route("/api/v1/ws", get(ws::upgrade))
        .route("/api/v1/rules", get(rules::list_rules).post(rules::create_rule))
        .route(
            "/api/v1/rules/:rule_id",
            get(rules::get_rule)
                .patch(rules::update_rule)
                .delete(rules::delete_rule),
        )
        .route("/api/v1/rules/:rule_id/submit", post(rules::submit_rule))
        .route("/api/v1/rules/:rule_id/resubmit", post(rules::resubmit_rule))
        .route("/api/v1/rules/:rule_id/reset", post(rules::reset_rule))
        .route(
            "/api/v1/rules/:rule_id/approvals",
            get(rules::list_approvals).post(rules::vote),
        )
        .route(
            "/api/v1/rules/:rule_id/attachments",
            get(rules::list_attachments).post(rules::attach),
        )
        .route(
            "/api/v1/rules/:rule_id/attachments/:team_id/approve",
            post(rules::approve_attachment),
        )
        .route("/api/v1/rules/:rule_id/audit", get(rules::audit_trail))
        .route(
            "/api/v1/categories",
            get(rules::list_categories).put(rules::upsert_category),
        )
        .route("/api/v1/approval-configs", put(rules::set_approval_config))
        .route("/api/v1/changes", get(changes::list_changes))
        .route("/api/v1/changes/:change_id", get(changes::get_change))
        .route("/api/v1/changes/:change_id/approve", post(changes::approve_change))
        .route("/api/v1/changes/:change_id/reject", post(changes::reject_change))
        .route(
            "/api/v1/exceptions",
            get(exceptions::list_exceptions).post(exceptions::request_exception),
        )
        .route("/api/v1/exceptions/:exception_id", get(exceptions::get_exception))
        .route(
            "/api/v1/exceptions/:exception_id/approve",
            post(exceptions::approve_exception),
        )
        .route(
            "/api/v1/exceptions/:exception_id/deny",
            post(exceptions::deny_exception),
        )
        .route("/api/v1/agents", get(agents::list_agents))
        .route("/api/v1/agents/:agent_id/config", get(agents::agent_config))
        .route("/api/v1/agents/:agent_id/sync", post(agents::request_sync))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

//! Edictflow Server - WebSocket and HTTP shell around Edictflow Core
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  ControllerServer                     │
//! │  ┌────────────────────────────────────────────────┐  │
//! │  │        edictflow-core::engine::Controller       │  │
//! │  │            (all logic lives here)               │  │
//! │  └────────────────────────────────────────────────┘  │
//! │        ▲                 ▲                  │         │
//! │        │                 │                  ▼         │
//! │   /api/v1/*         sessions ◄──── SessionRegistry    │
//! │   (operators)       (agents)        (fan-out)         │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! The registry is the controller's [`Dispatcher`](edictflow_core::Dispatcher):
//! anything the engine emits for an agent is routed to that agent's live
//! session or dropped at the edge.

pub mod auth;
mod config;
pub mod error;
pub mod handlers;
pub mod registry;
pub mod routes;
pub mod session;
pub mod sweeper;

pub use config::{ServerConfig, ServerConfigBuilder};
pub use error::{Result, ServerError};

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::HeaderMap;
use axum::Router;
use edictflow_core::directory::StaticDirectory;
use edictflow_core::engine::{Controller, ControllerBuilder};
use edictflow_core::storage::{ControllerStore, InMemoryStore, SqliteStore};
use tokio_util::sync::CancellationToken;

use crate::auth::{Authenticator, Identity, StaticTokens};
use crate::registry::SessionRegistry;

/// Shared application state
pub struct AppState {
    pub controller: Controller,
    pub registry: Arc<SessionRegistry>,
    pub auth: Arc<dyn Authenticator>,
    pub config: ServerConfig,
    /// Parent of every session and background task
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Build the controller over `builder` with the session registry as its
    /// dispatcher
    pub fn new(config: ServerConfig, builder: ControllerBuilder, auth: Arc<dyn Authenticator>) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.outbound_buffer));
        let controller = builder.dispatcher(registry.clone()).build();
        Self {
            controller,
            registry,
            auth,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Authenticate a request by its bearer header
    pub fn identify(&self, headers: &HeaderMap) -> Result<Identity> {
        auth::identify(self.auth.as_ref(), headers)
    }
}

/// Edictflow controller server
///
/// # Example
///
/// ```rust,ignore
/// use edictflow_server::{ControllerServer, ServerConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let config = ServerConfig::builder().port(8420).build();
///     let server = ControllerServer::from_config(config).unwrap();
///     server.run().await.unwrap();
/// }
/// ```
pub struct ControllerServer {
    state: Arc<AppState>,
}

impl ControllerServer {
    pub fn new(state: AppState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    /// Open the store, directory and token table named by `config`
    pub fn from_config(config: ServerConfig) -> Result<Self> {
        let store: Arc<dyn ControllerStore> = match &config.database_path {
            Some(path) => Arc::new(SqliteStore::open(path)?),
            None => {
                tracing::warn!("no database configured; state will not survive restart");
                Arc::new(InMemoryStore::new())
            }
        };
        store.health_check()?;

        let directory = match &config.directory_path {
            Some(path) => StaticDirectory::from_file(path)?,
            None => StaticDirectory::new(),
        };
        let tokens = match &config.tokens_path {
            Some(path) => StaticTokens::from_file(path)?,
            None => StaticTokens::new(),
        };
        if tokens.is_empty() {
            tracing::warn!("no bearer tokens configured; every request will be refused");
        }

        let builder = Controller::builder()
            .store(store)
            .directory(Arc::new(directory));
        Ok(Self::new(AppState::new(config, builder, Arc::new(tokens))))
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Build the Axum router with all routes
    pub fn router(&self) -> Router {
        routes::create_router(Arc::clone(&self.state))
    }

    /// Get the socket address for the server
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.state.config.port))
    }

    /// Serve on an already-bound listener until `shutdown` resolves
    pub async fn serve(
        &self,
        listener: tokio::net::TcpListener,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let sweeper = sweeper::spawn(
            self.state.controller.clone(),
            self.state.config.sweep_interval,
            self.state.shutdown.child_token(),
        );

        let token = self.state.shutdown.clone();
        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                shutdown.await;
                token.cancel();
            })
            .await;

        self.state.shutdown.cancel();
        if let Err(e) = sweeper.await {
            tracing::warn!(error = %e, "sweeper task failed");
        }
        result.map_err(ServerError::from)
    }

    /// Run the server until Ctrl-C
    pub async fn run(&self) -> Result<()> {
        let addr = self.addr();
        let listener = tokio::net::TcpListener::bind(addr).await?;

        tracing::info!("Edictflow controller listening on http://{}", addr);
        tracing::info!("Endpoints:");
        tracing::info!("  GET  /health");
        tracing::info!("  GET  /api/v1/ws");
        tracing::info!("  *    /api/v1/rules, /api/v1/changes, /api/v1/exceptions, /api/v1/agents");

        self.serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await
    }
}

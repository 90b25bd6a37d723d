//! Edictflow Agent - keeps managed files on a workstation in line with the controller
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Daemon                              │
//! │                                                              │
//! │  FileWatcher ──► Reconciler ──► OutboundQueue ──┐            │
//! │                      ▲              (SQLite)    │            │
//! │                      │                          ▼            │
//! │  control socket   SessionClient ◄────────► Connector ◄──► controller
//! │  (status/sync)    (heartbeat, dispatch)    (WebSocket)       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every report the agent makes is written to the [`store`] before it is
//! sent and deleted when the controller acknowledges it, so reports survive
//! restarts and network partitions. Everything the controller sends is a
//! hint the agent can re-derive from the next heartbeat.

pub mod auth;
pub mod config;
pub mod context;
pub mod daemon;
pub mod diff;
pub mod error;
pub mod ipc;
pub mod notifier;
pub mod queue;
pub mod reconcile;
pub mod session;
pub mod store;
pub mod transport;
pub mod watcher;

pub use config::{AgentConfig, AgentPaths};
pub use daemon::Daemon;
pub use error::{AgentError, Result};
pub use queue::OutboundQueue;
pub use reconcile::{DriftOutcome, Reconciler};
pub use session::{Backoff, SessionClient, SessionParts, SessionStatus};
pub use store::AgentStore;
pub use transport::{Connector, Link, MemoryConnector, WebSocketConnector};

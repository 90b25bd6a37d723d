//! Daemon wiring
//!
//! Owns the store, queue, reconciler and watcher, and runs the long-lived
//! tasks around them: the session client, the queue janitor, the watcher
//! event dispatcher and the control socket. Cancelling the token stops all
//! of them; the socket and PID files are removed on the way out.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use edictflow_core::model::ProjectContext;
use edictflow_core::protocol::{ContextDetectedPayload, ExceptionRequestPayload, Message};
use edictflow_core::{Clock, SystemClock};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{AgentConfig, AgentPaths};
use crate::context::detect_context;
use crate::error::{AgentError, Result};
use crate::ipc::{IpcHandler, IpcRequest, IpcServer, PidFile, StatusReply};
use crate::notifier::{LogNotifier, Notifier};
use crate::queue::{spawn_janitor, OutboundQueue};
use crate::reconcile::Reconciler;
use crate::session::{SessionClient, SessionParts, SessionStatus};
use crate::store::AgentStore;
use crate::transport::{Connector, WebSocketConnector};
use crate::watcher::FileWatcher;

/// The running agent
pub struct Daemon {
    paths: AgentPaths,
    config: AgentConfig,
    store: Arc<AgentStore>,
    queue: Arc<OutboundQueue>,
    reconciler: Arc<Reconciler>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    status: Arc<SessionStatus>,
    watcher: Mutex<Option<FileWatcher>>,
}

/// Config file plus the store's overrides
pub fn effective_config(home: &Path, store: &AgentStore) -> Result<AgentConfig> {
    let mut config = AgentConfig::load(home)?;
    for (key, value) in store.config_entries()? {
        config.apply_override(&key, &value)?;
    }
    Ok(config)
}

impl Daemon {
    /// Open the store under `paths` and load the effective configuration
    pub fn open(paths: AgentPaths) -> Result<Self> {
        paths.ensure()?;
        let store = Arc::new(AgentStore::open(paths.database())?);
        let config = effective_config(&paths.home, &store)?;
        Ok(Self::new(paths, config, store, Arc::new(LogNotifier), Arc::new(SystemClock)))
    }

    pub fn new(
        paths: AgentPaths,
        config: AgentConfig,
        store: Arc<AgentStore>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let queue = Arc::new(OutboundQueue::new(store.clone(), config.queue.clone(), clock.clone()));
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            queue.clone(),
            notifier.clone(),
            clock.clone(),
            config.managed_filename.clone(),
        ));
        Self {
            paths,
            config,
            store,
            queue,
            reconciler,
            notifier,
            clock,
            status: Arc::new(SessionStatus::new()),
            watcher: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<AgentStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<OutboundQueue> {
        &self.queue
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// WebSocket connector for the configured controller
    pub fn default_connector(&self) -> Arc<dyn Connector> {
        Arc::new(WebSocketConnector::new(
            self.config.session_url(),
            self.config.write_timeout(),
        ))
    }

    /// Run until `cancel` fires or the session fails fatally
    pub async fn run(self: Arc<Self>, connector: Arc<dyn Connector>, cancel: CancellationToken) -> Result<()> {
        if self.store.load_auth()?.is_none() {
            return Err(AgentError::NotAuthenticated);
        }
        let ipc = IpcServer::bind(self.paths.socket()).await?;
        let _pid = PidFile::create(self.paths.pid_file())?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.start_watcher(events_tx)?;
        match self.reconciler.reconcile_all() {
            Ok(written) => tracing::info!(files = written, "startup render complete"),
            Err(e) => tracing::warn!(error = %e, "startup render failed"),
        }

        let tasks = vec![
            ipc.spawn(self.clone(), cancel.clone()),
            spawn_janitor(
                self.queue.clone(),
                Duration::from_secs(self.config.queue.janitor_interval_secs.max(1)),
                cancel.clone(),
            ),
            tokio::spawn(self.clone().dispatch_events(events_rx, cancel.clone())),
        ];

        let session = SessionClient::new(
            connector,
            SessionParts {
                store: self.store.clone(),
                queue: self.queue.clone(),
                reconciler: self.reconciler.clone(),
                notifier: self.notifier.clone(),
                clock: self.clock.clone(),
                status: self.status.clone(),
            },
            self.config.heartbeat_interval(),
            self.config.backoff.clone(),
        );
        tracing::info!(
            server = %self.config.server_url,
            home = %self.paths.home.display(),
            "agent started"
        );
        let outcome = session.run(cancel.clone()).await;

        cancel.cancel();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "task ended abnormally");
            }
        }
        self.watcher.lock().take();
        tracing::info!("agent stopped");
        outcome
    }

    fn start_watcher(&self, events: mpsc::UnboundedSender<PathBuf>) -> Result<()> {
        let mut watcher = FileWatcher::new(self.config.managed_filename.clone(), events)?;
        for project in self.store.projects()? {
            if let Err(e) = watcher.watch_project(Path::new(&project.path)) {
                tracing::warn!(project = %project.path, error = %e, "cannot watch project");
            }
        }
        *self.watcher.lock() = Some(watcher);
        Ok(())
    }

    /// Re-register a project's watch, switching between file and directory
    fn rewatch(&self, project_dir: &Path) {
        if let Some(watcher) = self.watcher.lock().as_mut() {
            if let Err(e) = watcher.watch_project(project_dir) {
                tracing::warn!(project = %project_dir.display(), error = %e, "cannot watch project");
            }
        }
    }

    async fn dispatch_events(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<PathBuf>, cancel: CancellationToken) {
        loop {
            let path = tokio::select! {
                _ = cancel.cancelled() => break,
                next = events.recv() => match next {
                    Some(path) => path,
                    None => break,
                },
            };
            match self.reconciler.on_file_event(&path) {
                Ok(outcome) => tracing::trace!(file = %path.display(), ?outcome, "file event handled"),
                Err(e) => tracing::warn!(file = %path.display(), error = %e, "file event failed"),
            }
            if let Some(dir) = path.parent() {
                self.rewatch(dir);
            }
        }
        tracing::debug!("watcher dispatcher stopped");
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Control operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Register a project, render into it and report its context
    pub fn add_project(&self, path: &str, tags: Vec<String>) -> Result<ProjectContext> {
        let dir = std::fs::canonicalize(path)
            .map_err(|_| AgentError::ProjectNotFound(path.to_string()))?;
        if !dir.is_dir() {
            return Err(AgentError::ProjectNotFound(path.to_string()));
        }
        let mut tags = tags;
        tags.sort();
        tags.dedup();
        let project = ProjectContext {
            path: dir.to_string_lossy().into_owned(),
            context_types: detect_context(&dir),
            tags,
        };
        self.store.upsert_project(&project, self.clock.now())?;
        self.reconciler.reconcile_project(&project)?;
        self.rewatch(&dir);
        self.queue.enqueue(Message::ContextDetected(ContextDetectedPayload {
            project_path: project.path.clone(),
            context_types: project.context_types.clone(),
            tags: project.tags.clone(),
        }))?;
        tracing::info!(project = %project.path, contexts = ?project.context_types, "project added");
        Ok(project)
    }

    /// Forget a project; its managed file is left as is
    pub fn remove_project(&self, path: &str) -> Result<bool> {
        let key = std::fs::canonicalize(path)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| path.to_string());
        let removed = self.store.remove_project(&key)?;
        if removed {
            if let Some(watcher) = self.watcher.lock().as_mut() {
                watcher.unwatch_project(Path::new(&key))?;
            }
            tracing::info!(project = %key, "project removed");
        }
        Ok(removed)
    }

    pub fn status(&self) -> Result<StatusReply> {
        Ok(StatusReply {
            running: true,
            connected: self.status.is_connected(),
            cached_version: self.store.cached_version()?,
            projects: self.store.projects()?.into_iter().map(|p| p.path).collect(),
            pending_messages: self.queue.len()?,
        })
    }
}

#[async_trait]
impl IpcHandler for Daemon {
    async fn handle(&self, request: IpcRequest) -> Result<Value> {
        match request {
            IpcRequest::Status => Ok(serde_json::to_value(self.status()?)?),
            IpcRequest::Sync => {
                self.status.request_sync();
                Ok(json!({ "status": "sync_requested" }))
            }
            IpcRequest::AddProject { path, tags } => {
                let project = self.add_project(&path, tags)?;
                Ok(json!({
                    "status": "added",
                    "path": project.path,
                    "context_types": project.context_types,
                }))
            }
            IpcRequest::RemoveProject { path } => {
                if self.remove_project(&path)? {
                    Ok(json!({ "status": "removed" }))
                } else {
                    Err(AgentError::ProjectNotFound(path))
                }
            }
            IpcRequest::RequestException {
                change_id,
                justification,
                exception_type,
                duration_hours,
            } => {
                let ref_id = self.reconciler.request_exception(ExceptionRequestPayload {
                    change_id,
                    justification,
                    exception_type,
                    duration_hours,
                })?;
                Ok(json!({ "status": "requested", "ref_id": ref_id }))
            }
        }
    }
}

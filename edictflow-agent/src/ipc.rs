//! Local control socket
//!
//! A per-user UNIX socket under the agent home accepts newline-delimited
//! JSON requests and answers each with one JSON line. The socket file is
//! created with owner-only permissions on start and removed on shutdown; a
//! PID file next to it tells supervisors the daemon is alive.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use edictflow_core::model::ExceptionType;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, Result};

/// One control request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum IpcRequest {
    Status,
    Sync,
    AddProject {
        path: String,
        #[serde(default)]
        tags: Vec<String>,
    },
    RemoveProject {
        path: String,
    },
    RequestException {
        change_id: String,
        justification: String,
        exception_type: ExceptionType,
        #[serde(default)]
        duration_hours: Option<u32>,
    },
}

/// Reply to `status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReply {
    pub running: bool,
    pub connected: bool,
    pub cached_version: u64,
    pub projects: Vec<String>,
    pub pending_messages: usize,
}

/// Executes control requests
#[async_trait]
pub trait IpcHandler: Send + Sync {
    async fn handle(&self, request: IpcRequest) -> Result<Value>;
}

fn error_reply(message: impl std::fmt::Display) -> Value {
    json!({ "error": message.to_string() })
}

/// Decode one line and run it
pub async fn respond(handler: &dyn IpcHandler, line: &str) -> Value {
    match serde_json::from_str::<IpcRequest>(line) {
        Ok(request) => match handler.handle(request).await {
            Ok(reply) => reply,
            Err(e) => error_reply(e),
        },
        Err(e) => error_reply(format!("invalid request: {}", e)),
    }
}

/// Bound control socket
pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcServer {
    /// Bind at `path`, replacing a stale socket file
    pub async fn bind(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if UnixStream::connect(&path).await.is_ok() {
            return Err(AgentError::Config(format!(
                "another agent is already listening on {}",
                path.display()
            )));
        }
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!(socket = %path.display(), "removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let listener = UnixListener::bind(&path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }
        tracing::info!(socket = %path.display(), "control socket listening");
        Ok(Self { listener, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until cancelled, then remove the socket file
    pub fn spawn(self, handler: Arc<dyn IpcHandler>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = self.listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            let handler = handler.clone();
                            tokio::spawn(async move {
                                if let Err(e) = serve_client(stream, handler.as_ref()).await {
                                    tracing::debug!(error = %e, "control client dropped");
                                }
                            });
                        }
                        Err(e) => tracing::warn!(error = %e, "control accept failed"),
                    },
                }
            }
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::debug!(error = %e, "socket cleanup failed");
            }
            tracing::debug!("control socket closed");
        })
    }
}

async fn serve_client(stream: UnixStream, handler: &dyn IpcHandler) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = respond(handler, &line).await;
        let mut bytes = serde_json::to_vec(&reply)?;
        bytes.push(b'\n');
        writer.write_all(&bytes).await?;
        writer.flush().await?;
    }
    Ok(())
}

/// Send one request to a running daemon and read its reply
pub async fn request(socket: &Path, request: &IpcRequest) -> Result<Value> {
    let stream = UnixStream::connect(socket).await.map_err(|e| {
        AgentError::Transport(format!("agent not running at {}: {}", socket.display(), e))
    })?;
    let (reader, mut writer) = stream.into_split();
    let mut line = serde_json::to_vec(request)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;

    let mut reply = String::new();
    BufReader::new(reader).read_line(&mut reply).await?;
    if reply.is_empty() {
        return Err(AgentError::SessionClosed);
    }
    Ok(serde_json::from_str(&reply)?)
}

/// PID file removed on drop
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        std::fs::write(&path, format!("{}\n", std::process::id()))?;
        Ok(Self { path })
    }

    /// PID recorded at `path`, if any
    pub fn read(path: &Path) -> Option<u32> {
        std::fs::read_to_string(path).ok()?.trim().parse().ok()
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl IpcHandler for Echo {
        async fn handle(&self, request: IpcRequest) -> Result<Value> {
            match request {
                IpcRequest::Sync => Ok(json!({ "status": "sync_requested" })),
                IpcRequest::RemoveProject { path } => Err(AgentError::ProjectNotFound(path)),
                other => Ok(serde_json::to_value(other)?),
            }
        }
    }

    #[test]
    fn test_request_shapes() {
        let req: IpcRequest = serde_json::from_str(r#"{"command":"add_project","path":"/w/app"}"#).unwrap();
        assert_eq!(
            req,
            IpcRequest::AddProject {
                path: "/w/app".into(),
                tags: vec![]
            }
        );
        let req: IpcRequest = serde_json::from_str(
            r#"{"command":"request_exception","change_id":"c1","justification":"hotfix","exception_type":"time_limited","duration_hours":4}"#,
        )
        .unwrap();
        assert!(matches!(req, IpcRequest::RequestException { duration_hours: Some(4), .. }));
    }

    #[tokio::test]
    async fn test_unknown_command_replies_error() {
        let reply = respond(&Echo, r#"{"command":"explode"}"#).await;
        assert!(reply["error"].as_str().unwrap().contains("invalid request"));
        let reply = respond(&Echo, r#"{"command":"remove_project","path":"/nope"}"#).await;
        assert!(reply["error"].as_str().unwrap().contains("/nope"));
    }

    #[tokio::test]
    async fn test_socket_round_trip_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("agent.sock");
        let server = IpcServer::bind(&socket).await.unwrap();
        let cancel = CancellationToken::new();
        let task = server.spawn(Arc::new(Echo), cancel.clone());

        let reply = request(&socket, &IpcRequest::Sync).await.unwrap();
        assert_eq!(reply, json!({ "status": "sync_requested" }));

        // A second bind while the first is serving is refused
        assert!(IpcServer::bind(&socket).await.is_err());

        cancel.cancel();
        task.await.unwrap();
        assert!(!socket.exists());
    }

    #[test]
    fn test_pid_file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.pid");
        {
            let _pid = PidFile::create(&path).unwrap();
            assert_eq!(PidFile::read(&path), Some(std::process::id()));
        }
        assert!(!path.exists());
    }
}

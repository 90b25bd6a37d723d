//! Session transports
//!
//! A [`Connector`] opens one authenticated link to the controller and hands
//! the session client a pair of text-frame channels. Closing either side
//! closes the link: the incoming channel ends when the peer goes away, and
//! dropping the outgoing sender shuts the connection down.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, Result};

/// Frames buffered in each direction of a link
pub const LINK_BUFFER: usize = 256;

/// A live link: text frames out, text frames in
pub struct Link {
    pub outgoing: mpsc::Sender<String>,
    pub incoming: mpsc::Receiver<String>,
}

/// Opens links to the controller
#[async_trait]
pub trait Connector: Send + Sync {
    /// Backend name, for logs
    fn name(&self) -> &str;

    /// Open an authenticated link using bearer `token`
    async fn connect(&self, token: &str) -> Result<Link>;
}

// ═══════════════════════════════════════════════════════════════════════════
// WebSocket
// ═══════════════════════════════════════════════════════════════════════════

/// WebSocket link to the controller's session endpoint
pub struct WebSocketConnector {
    url: String,
    write_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>, write_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            write_timeout,
        }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    fn name(&self) -> &str {
        "websocket"
    }

    async fn connect(&self, token: &str) -> Result<Link> {
        let mut request = self.url.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| AgentError::Config(format!("credential is not a valid header: {}", e)))?;
        request.headers_mut().insert("authorization", bearer);

        let (socket, _) = tokio_tungstenite::connect_async(request).await?;
        tracing::debug!(url = %self.url, "websocket connected");
        let (mut sink, mut stream) = socket.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(LINK_BUFFER);
        let (in_tx, in_rx) = mpsc::channel::<String>(LINK_BUFFER);
        let closed = CancellationToken::new();
        let write_timeout = self.write_timeout;

        let writer_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_closed.cancelled() => break,
                    frame = out_rx.recv() => {
                        let Some(text) = frame else { break };
                        match tokio::time::timeout(write_timeout, sink.send(WsMessage::Text(text))).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                tracing::debug!(error = %e, "websocket write failed");
                                break;
                            }
                            Err(_) => {
                                tracing::warn!("websocket write deadline exceeded");
                                break;
                            }
                        }
                    }
                }
            }
            let _ = tokio::time::timeout(write_timeout, sink.send(WsMessage::Close(None))).await;
            writer_closed.cancel();
        });

        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = closed.cancelled() => break,
                    frame = stream.next() => frame,
                };
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        if in_tx.send(text).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => {
                            if in_tx.send(text).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => tracing::debug!("non-UTF-8 binary frame dropped"),
                    },
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    // Pings are answered by the protocol layer
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "websocket read failed");
                        break;
                    }
                }
            }
            closed.cancel();
        });

        Ok(Link {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// In-memory
// ═══════════════════════════════════════════════════════════════════════════

/// The controller side of an in-memory link
pub struct MemoryPeer {
    /// Token the agent presented
    pub token: String,
    /// Frames to the agent
    pub to_agent: mpsc::Sender<String>,
    /// Frames from the agent
    pub from_agent: mpsc::Receiver<String>,
}

/// In-process connector; each successful connect hands a [`MemoryPeer`] to
/// the paired [`MemoryListener`]
pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    refusals: parking_lot::Mutex<u32>,
}

/// Receives the controller side of each in-memory link
pub struct MemoryListener {
    peers: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryConnector {
    pub fn pair() -> (Self, MemoryListener) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                peers: tx,
                refusals: parking_lot::Mutex::new(0),
            },
            MemoryListener { peers: rx },
        )
    }

    /// Fail the next `n` connection attempts
    pub fn refuse_next(&self, n: u32) {
        *self.refusals.lock() = n;
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(&self, token: &str) -> Result<Link> {
        {
            let mut refusals = self.refusals.lock();
            if *refusals > 0 {
                *refusals -= 1;
                return Err(AgentError::Transport("connection refused".into()));
            }
        }
        let (to_agent, incoming) = mpsc::channel(LINK_BUFFER);
        let (outgoing, from_agent) = mpsc::channel(LINK_BUFFER);
        self.peers
            .send(MemoryPeer {
                token: token.to_string(),
                to_agent,
                from_agent,
            })
            .map_err(|_| AgentError::Transport("listener closed".into()))?;
        Ok(Link { outgoing, incoming })
    }
}

impl MemoryListener {
    /// Next accepted link; `None` once the connector is dropped
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.peers.recv().await
    }
}

//! Live session registry and fan-out
//!
//! One entry per agent id. A new handshake for a registered agent replaces
//! the entry and cancels the previous session's writer; the old session sees
//! a plain disconnect. Sends never block: each session has a bounded buffer
//! and a full buffer drops the frame.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use edictflow_core::engine::Dispatcher;
use edictflow_core::protocol::{Envelope, Message};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Entry {
    session_id: u64,
    outbound: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
}

/// What a session task needs after registering
pub struct SessionLease {
    pub agent_id: String,
    pub session_id: u64,
    pub outbound: mpsc::Receiver<Envelope>,
    /// Sender into this session's own buffer, for replies
    pub replies: mpsc::Sender<Envelope>,
    pub cancel: CancellationToken,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Entry>>,
    next_id: AtomicU64,
    buffer: usize,
}

impl SessionRegistry {
    pub fn new(buffer: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    /// Register a session for `agent_id`, superseding any live one
    pub fn register(&self, agent_id: &str, parent: &CancellationToken) -> SessionLease {
        let (tx, rx) = mpsc::channel(self.buffer);
        let session_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = parent.child_token();

        let previous = self.sessions.write().insert(
            agent_id.to_string(),
            Entry {
                session_id,
                outbound: tx.clone(),
                cancel: cancel.clone(),
            },
        );
        if let Some(previous) = previous {
            tracing::info!(
                agent_id = %agent_id,
                superseded = previous.session_id,
                "session superseded"
            );
            previous.cancel.cancel();
        }

        SessionLease {
            agent_id: agent_id.to_string(),
            session_id,
            outbound: rx,
            replies: tx,
            cancel,
        }
    }

    /// Drop the entry if it still belongs to `session_id`
    pub fn unregister(&self, agent_id: &str, session_id: u64) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get(agent_id) {
            Some(entry) if entry.session_id == session_id => {
                sessions.remove(agent_id);
                true
            }
            _ => false,
        }
    }

    /// Queue an envelope; false when the agent is absent or its buffer is full
    pub fn send(&self, agent_id: &str, envelope: Envelope) -> bool {
        let sessions = self.sessions.read();
        let Some(entry) = sessions.get(agent_id) else {
            return false;
        };
        match entry.outbound.try_send(envelope) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(env)) => {
                tracing::warn!(agent_id = %agent_id, message = %env.message_type, "outbound buffer full; frame dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_connected(&self, agent_id: &str) -> bool {
        self.sessions.read().contains_key(agent_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

impl Dispatcher for SessionRegistry {
    fn dispatch(&self, agent_id: &str, message: Message) -> bool {
        match Envelope::new(message) {
            Ok(envelope) => self.send(agent_id, envelope),
            Err(e) => {
                tracing::error!(agent_id = %agent_id, error = %e, "failed to encode outbound message");
                false
            }
        }
    }

    fn connected_agents(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }
}

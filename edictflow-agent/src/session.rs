//! Session client
//!
//! Keeps one logical session to the controller alive. Each connection:
//!
//! 1. sends a heartbeat immediately,
//! 2. replays every unacknowledged queue entry in insertion order,
//! 3. then multiplexes inbound frames, newly queued entries, the heartbeat
//!    ticker, the resend ticker and sync requests until the link drops.
//!
//! Entries sent on the current link that stay unacknowledged for the queue's
//! resend interval are sent again, until they run out of attempts.
//!
//! Reconnection backs off exponentially from `initial_secs`, doubling up to
//! `max_secs`, and resets after a successful connect. Controller frames are
//! hints: anything lost while disconnected is re-derived from the next
//! heartbeat.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use edictflow_core::protocol::{AgentStatus, Envelope, HeartbeatPayload, Message};
use edictflow_core::Clock;
use tokio::sync::{mpsc, Notify};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::BackoffConfig;
use crate::error::{AgentError, Result};
use crate::notifier::{notify_quietly, NotificationKind, Notifier};
use crate::queue::OutboundQueue;
use crate::reconcile::Reconciler;
use crate::store::AgentStore;
use crate::transport::{Connector, Link};

/// Exponential reconnect delay
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        let initial = Duration::from_secs(config.initial_secs.max(1));
        let max = Duration::from_secs(config.max_secs).max(initial);
        Self {
            initial,
            max,
            next: initial,
        }
    }

    /// Delay before the next attempt; doubles the one after, up to the cap
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

/// Live view of the session for status queries
#[derive(Debug, Default)]
pub struct SessionStatus {
    connected: AtomicBool,
    sync: Notify,
}

impl SessionStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    /// Ask the live session for an immediate heartbeat
    pub fn request_sync(&self) {
        self.sync.notify_one();
    }
}

/// Everything the session needs besides the connector
pub struct SessionParts {
    pub store: Arc<AgentStore>,
    pub queue: Arc<OutboundQueue>,
    pub reconciler: Arc<Reconciler>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
    pub status: Arc<SessionStatus>,
}

pub struct SessionClient {
    connector: Arc<dyn Connector>,
    store: Arc<AgentStore>,
    queue: Arc<OutboundQueue>,
    reconciler: Arc<Reconciler>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    status: Arc<SessionStatus>,
    heartbeat_interval: Duration,
    backoff: BackoffConfig,
}

impl SessionClient {
    pub fn new(
        connector: Arc<dyn Connector>,
        parts: SessionParts,
        heartbeat_interval: Duration,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            connector,
            store: parts.store,
            queue: parts.queue,
            reconciler: parts.reconciler,
            notifier: parts.notifier,
            clock: parts.clock,
            status: parts.status,
            heartbeat_interval,
            backoff,
        }
    }

    pub fn status(&self) -> Arc<SessionStatus> {
        self.status.clone()
    }

    /// Connect, drive, reconnect until cancelled or a fatal error
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut backoff = Backoff::new(&self.backoff);
        let mut lost = false;

        while !cancel.is_cancelled() {
            let auth = self.store.load_auth()?.ok_or(AgentError::NotAuthenticated)?;
            if auth.is_expired_at(self.clock.now()) {
                let at = auth.expires_at.map(|t| t.to_rfc3339()).unwrap_or_default();
                return Err(AgentError::CredentialExpired(at));
            }

            match self.connector.connect(&auth.token).await {
                Ok(link) => {
                    backoff.reset();
                    self.status.set_connected(true);
                    tracing::info!(transport = self.connector.name(), agent_id = %auth.agent_id, "session established");
                    if lost {
                        notify_quietly(
                            self.notifier.as_ref(),
                            NotificationKind::ConnectionRestored,
                            "Connection restored",
                            "Reconnected to the controller",
                        );
                    }

                    let outcome = self.drive(link, &cancel).await;
                    self.status.set_connected(false);
                    match outcome {
                        Ok(()) => break,
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => tracing::warn!(error = %e, "session lost"),
                    }
                    if !lost {
                        notify_quietly(
                            self.notifier.as_ref(),
                            NotificationKind::ConnectionLost,
                            "Connection lost",
                            "Changes are queued until the controller is reachable",
                        );
                    }
                    lost = true;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => tracing::warn!(error = %e, "connect failed"),
            }

            let delay = backoff.next_delay();
            tracing::debug!(delay_secs = delay.as_secs(), "reconnecting after backoff");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        tracing::info!("session client stopped");
        Ok(())
    }

    /// Serve one link; `Ok` only when cancelled
    async fn drive(&self, link: Link, cancel: &CancellationToken) -> Result<()> {
        let Link { outgoing, mut incoming } = link;

        // Unacknowledged entries sent on this link, by seq
        let mut in_flight: HashMap<i64, Instant> = HashMap::new();

        self.send_heartbeat(&outgoing).await?;
        let mut last_seq = self.flush(&outgoing, 0, &mut in_flight).await?;

        let mut ticker = interval_at(Instant::now() + self.heartbeat_interval, self.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let resend_after = self.queue.resend_after();
        let mut resend = interval_at(Instant::now() + resend_after, resend_after);
        resend.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                frame = incoming.recv() => match frame {
                    Some(text) => self.dispatch(&text, &outgoing).await?,
                    None => return Err(AgentError::SessionClosed),
                },
                _ = self.queue.ready() => {
                    last_seq = self.flush(&outgoing, last_seq, &mut in_flight).await?;
                }
                _ = ticker.tick() => self.send_heartbeat(&outgoing).await?,
                _ = resend.tick() => self.resend_unacked(&outgoing, &mut in_flight).await?,
                _ = self.status.sync.notified() => {
                    tracing::debug!("sync requested");
                    self.send_heartbeat(&outgoing).await?;
                }
            }
        }
    }

    async fn send(&self, outgoing: &mpsc::Sender<String>, frame: String) -> Result<()> {
        outgoing.send(frame).await.map_err(|_| AgentError::SessionClosed)
    }

    /// Heartbeats are never queued; the next connection sends a fresh one
    async fn send_heartbeat(&self, outgoing: &mpsc::Sender<String>) -> Result<()> {
        let heartbeat = self.heartbeat()?;
        let frame = Envelope::new(Message::Heartbeat(heartbeat))?.encode()?;
        self.send(outgoing, frame).await
    }

    pub fn heartbeat(&self) -> Result<HeartbeatPayload> {
        Ok(HeartbeatPayload {
            status: AgentStatus::Online,
            cached_version: self.store.cached_version()?,
            active_projects: self.store.projects()?.into_iter().map(|p| p.path).collect(),
            hostname: std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()),
            agent_version: Some(env!("CARGO_PKG_VERSION").to_string()),
        })
    }

    /// Send queue entries after `after_seq`; returns the last seq sent
    async fn flush(
        &self,
        outgoing: &mpsc::Sender<String>,
        mut after_seq: i64,
        in_flight: &mut HashMap<i64, Instant>,
    ) -> Result<i64> {
        loop {
            let batch = self.queue.pending_after(after_seq)?;
            if batch.is_empty() {
                return Ok(after_seq);
            }
            for entry in batch {
                self.queue.mark_sent(entry.seq)?;
                tracing::debug!(ref_id = %entry.ref_id, message = %entry.message_type, attempt = entry.attempts + 1, "sending");
                self.send(outgoing, entry.payload).await?;
                in_flight.insert(entry.seq, Instant::now());
                after_seq = entry.seq;
            }
        }
    }

    /// Send again every entry still unacknowledged `resend_after` after its last send
    ///
    /// Acked and exhausted entries no longer come back from the queue and are
    /// dropped from `in_flight`.
    async fn resend_unacked(
        &self,
        outgoing: &mpsc::Sender<String>,
        in_flight: &mut HashMap<i64, Instant>,
    ) -> Result<()> {
        let resend_after = self.queue.resend_after();
        let mut live = HashSet::new();
        let mut after_seq = 0;
        loop {
            let batch = self.queue.pending_after(after_seq)?;
            if batch.is_empty() {
                break;
            }
            for entry in batch {
                after_seq = entry.seq;
                live.insert(entry.seq);
                let Some(sent_at) = in_flight.get(&entry.seq).copied() else {
                    continue;
                };
                if sent_at.elapsed() < resend_after {
                    continue;
                }
                self.queue.mark_sent(entry.seq)?;
                tracing::debug!(ref_id = %entry.ref_id, message = %entry.message_type, attempt = entry.attempts + 1, "resending unacknowledged");
                self.send(outgoing, entry.payload).await?;
                in_flight.insert(entry.seq, Instant::now());
            }
        }
        in_flight.retain(|seq, _| live.contains(seq));
        Ok(())
    }

    /// Handle one inbound frame; handler failures are logged, not fatal to the link
    async fn dispatch(&self, text: &str, outgoing: &mpsc::Sender<String>) -> Result<()> {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "undecodable frame dropped");
                return Ok(());
            }
        };
        let message = match envelope.message() {
            Ok(Some(message)) => message,
            Ok(None) => {
                tracing::debug!(message = %envelope.message_type, "unknown message type dropped");
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(message = %envelope.message_type, error = %e, "malformed payload dropped");
                return Ok(());
            }
        };

        let result = match message {
            Message::ConfigUpdate(config) => self.reconciler.apply_config(&config).map(|_| ()),
            Message::Ack(ack) => self.on_ack(&ack.ref_id, ack.entity_id.as_deref(), ack.error.as_deref()),
            Message::ChangeApproved(p) => self.reconciler.on_change_approved(&p),
            Message::ChangeRejected(p) => self.reconciler.on_change_rejected(&p),
            Message::ExceptionGranted(p) => self.reconciler.on_exception_granted(&p),
            Message::ExceptionDenied(p) => self.reconciler.on_exception_denied(&p),
            Message::SyncRequest(p) => {
                tracing::info!(reason = p.reason.as_deref().unwrap_or(""), "sync requested by controller");
                self.send_heartbeat(outgoing).await?;
                self.reconciler
                    .drift_report()
                    .and_then(|report| self.queue.enqueue(Message::DriftReport(report)).map(|_| ()))
            }
            other => {
                tracing::debug!(message = other.message_type().as_str(), "agent-originated type from controller dropped");
                Ok(())
            }
        };
        if let Err(e) = result {
            if e.is_fatal() {
                return Err(e);
            }
            tracing::warn!(message = %envelope.message_type, error = %e, "handler failed");
        }
        Ok(())
    }

    fn on_ack(&self, ref_id: &str, entity_id: Option<&str>, error: Option<&str>) -> Result<()> {
        if let Some(error) = error {
            tracing::warn!(ref_id = %ref_id, error = %error, "controller rejected message");
        }
        self.queue.acknowledge(ref_id)?;
        if let Some(change_id) = entity_id {
            if self.store.link_change(ref_id, change_id)? {
                tracing::debug!(ref_id = %ref_id, change_id = %change_id, "change linked");
            }
        }
        Ok(())
    }
}

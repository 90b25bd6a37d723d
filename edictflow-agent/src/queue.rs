//! Durable outbound queue
//!
//! Every agent -> controller report is written to the store before any
//! network attempt. The session drains entries in insertion order, counting
//! an attempt per send, and deletes an entry when the controller acks its
//! `ref_id`. An entry left unacknowledged on a live link is sent again after
//! `resend_after_secs`, so a controller that dropped it without an ack gets
//! another attempt without waiting for a reconnect. The janitor retires
//! entries that ran out of attempts or aged past the configured maximum.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use edictflow_core::protocol::{Envelope, Message};
use edictflow_core::Clock;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::Result;
use crate::store::{AgentStore, QueueEntry};

/// Entries handed to the session per drain step
pub const DRAIN_BATCH: usize = 64;

/// Queue of unacknowledged agent -> controller envelopes
pub struct OutboundQueue {
    store: Arc<AgentStore>,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    ready: Notify,
}

impl OutboundQueue {
    pub fn new(store: Arc<AgentStore>, config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            config,
            clock,
            ready: Notify::new(),
        }
    }

    /// Persist `message` under a fresh ref id and wake the sender
    pub fn enqueue(&self, message: Message) -> Result<String> {
        let ref_id = Uuid::new_v4().to_string();
        self.enqueue_as(&ref_id, message)?;
        Ok(ref_id)
    }

    /// Persist `message` under a ref id the caller already recorded elsewhere
    pub fn enqueue_as(&self, ref_id: &str, message: Message) -> Result<()> {
        let envelope = Envelope::with_ref_id(ref_id, message)?;
        self.store.enqueue(
            ref_id,
            &envelope.message_type,
            &envelope.encode()?,
            self.clock.now(),
        )?;
        tracing::debug!(ref_id = %ref_id, message = %envelope.message_type, "queued");
        self.ready.notify_one();
        Ok(())
    }

    /// Sendable entries after `after_seq`
    pub fn pending_after(&self, after_seq: i64) -> Result<Vec<QueueEntry>> {
        self.store
            .queued_after(after_seq, self.config.max_attempts, DRAIN_BATCH)
    }

    /// How long a sent entry waits for its ack before the session resends it
    pub fn resend_after(&self) -> Duration {
        Duration::from_secs(self.config.resend_after_secs.max(1))
    }

    pub fn mark_sent(&self, seq: i64) -> Result<()> {
        self.store.record_attempt(seq)
    }

    /// Drop the entry acknowledged under `ref_id`
    pub fn acknowledge(&self, ref_id: &str) -> Result<bool> {
        let removed = self.store.ack(ref_id)?;
        if !removed {
            tracing::debug!(ref_id = %ref_id, "ack for unknown or already retired entry");
        }
        Ok(removed)
    }

    /// Retire exhausted and expired entries
    pub fn janitor_pass(&self) -> Result<Vec<QueueEntry>> {
        let max_age = ChronoDuration::seconds(self.config.max_age_secs.min(i64::MAX as u64) as i64);
        let cutoff = self.clock.now() - max_age;
        let retired = self.store.retire(self.config.max_attempts, cutoff)?;
        for entry in &retired {
            tracing::warn!(
                ref_id = %entry.ref_id,
                message = %entry.message_type,
                attempts = entry.attempts,
                "retired undelivered message"
            );
        }
        Ok(retired)
    }

    pub fn len(&self) -> Result<usize> {
        self.store.queue_len()
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Resolves after the next enqueue (or immediately if one is unobserved)
    pub async fn ready(&self) {
        self.ready.notified().await
    }
}

/// Run [`OutboundQueue::janitor_pass`] every `interval` until cancelled
pub fn spawn_janitor(queue: Arc<OutboundQueue>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = queue.janitor_pass() {
                        tracing::warn!(error = %e, "queue janitor pass failed");
                    }
                }
            }
        }
        tracing::debug!("queue janitor stopped");
    })
}

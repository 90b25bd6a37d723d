//! Periodic auto-revert of expired temporary change requests

use std::time::Duration;

use edictflow_core::engine::Controller;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Run `sweep_expired` every `interval` until `cancel` fires
pub fn spawn(controller: Controller, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let controller = controller.clone();
                    // The sweep touches the store, which may block
                    if let Err(e) = tokio::task::spawn_blocking(move || sweep_once(&controller)).await {
                        tracing::error!(error = %e, "sweep task panicked");
                    }
                }
            }
        }
        tracing::debug!("sweeper stopped");
    })
}

/// One sweep; failures are logged and retried on the next tick
pub fn sweep_once(controller: &Controller) -> usize {
    match controller.changes().sweep_expired() {
        Ok(reverted) => {
            if !reverted.is_empty() {
                tracing::info!(count = reverted.len(), "auto-reverted expired changes");
            }
            reverted.len()
        }
        Err(e) => {
            tracing::warn!(error = %e, "sweep failed");
            0
        }
    }
}

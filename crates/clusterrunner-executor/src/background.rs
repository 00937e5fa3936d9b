//! Background task composition: the heartbeat loop that keeps the manager
//! aware this worker is still alive between build activity. Mirrors
//! `clusterrunner-manager`'s `BackgroundTasks` in shape, minus the sweep
//! (a worker has nothing to sweep; it only has something to report).

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::ManagerClient;

const TRACING_TARGET: &str = "clusterrunner_executor::background";

/// The worker's one long-lived background task: periodic heartbeats to
/// the manager.
pub struct BackgroundTasks {
    cancel_token: CancellationToken,
    heartbeat_handle: JoinHandle<()>,
}

impl BackgroundTasks {
    pub fn spawn(manager: Arc<ManagerClient>, worker_id: u32, interval: Duration, shutdown: CancellationToken) -> Self {
        let heartbeat_handle = tokio::spawn(heartbeat_loop(manager, worker_id, interval, shutdown.clone()));
        Self {
            cancel_token: shutdown,
            heartbeat_handle,
        }
    }

    /// Cancels the heartbeat loop and waits for it to exit. Shares its
    /// cancellation token with `AppState::kill_token`, so this is also
    /// called (indirectly, via the same token) when a kill request lands.
    pub async fn shutdown(self) {
        self.cancel_token.cancel();
        if let Err(err) = self.heartbeat_handle.await {
            tracing::warn!(target: TRACING_TARGET, error = %err, "Heartbeat task panicked");
        }
    }
}

async fn heartbeat_loop(manager: Arc<ManagerClient>, worker_id: u32, interval: Duration, cancel_token: CancellationToken) {
    tracing::info!(target: TRACING_TARGET, worker_id, "Starting heartbeat loop");
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            biased;

            () = cancel_token.cancelled() => {
                tracing::info!(target: TRACING_TARGET, worker_id, "Heartbeat loop stopping");
                break;
            }

            _ = ticker.tick() => {
                if let Err(err) = manager.heartbeat(worker_id).await {
                    tracing::warn!(target: TRACING_TARGET, worker_id, error = %err, "Heartbeat failed");
                }
            }
        }
    }
}

//! Background task composition: the worker allocator loop and the
//! heartbeat sweeper, composed with a shared cancellation token and
//! joinable handles so shutdown aborts every background worker together.

use std::sync::Arc;
use std::time::Duration;

use clusterrunner_core::allocator::WorkerAllocator;
use clusterrunner_core::manager::Manager;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::transport::ReqwestWorkerTransport;

const TRACING_TARGET: &str = "clusterrunner_manager::background";

/// The manager's long-lived background tasks: the worker allocator loop
/// and the heartbeat sweeper. Both share one cancellation token so a
/// single `shutdown()` call stops them together.
pub struct BackgroundTasks {
    cancel_token: CancellationToken,
    allocator_handle: JoinHandle<()>,
    heartbeat_handle: JoinHandle<()>,
}

impl BackgroundTasks {
    pub fn spawn(
        allocator: Arc<WorkerAllocator<ReqwestWorkerTransport>>,
        manager: Arc<Manager<ReqwestWorkerTransport>>,
        heartbeat_timeout: Duration,
        heartbeat_sweep_interval: Duration,
    ) -> Self {
        let cancel_token = CancellationToken::new();

        let allocator_handle = allocator.spawn(cancel_token.clone());
        let heartbeat_handle = tokio::spawn(heartbeat_sweep_loop(
            manager,
            heartbeat_timeout,
            heartbeat_sweep_interval,
            cancel_token.clone(),
        ));

        Self {
            cancel_token,
            allocator_handle,
            heartbeat_handle,
        }
    }

    /// Cancels both background loops and waits for them to exit.
    pub async fn shutdown(self) {
        self.cancel_token.cancel();
        if let Err(err) = self.allocator_handle.await {
            tracing::warn!(target: TRACING_TARGET, error = %err, "Allocator task panicked");
        }
        if let Err(err) = self.heartbeat_handle.await {
            tracing::warn!(target: TRACING_TARGET, error = %err, "Heartbeat sweeper task panicked");
        }
    }
}

async fn heartbeat_sweep_loop(
    manager: Arc<Manager<ReqwestWorkerTransport>>,
    timeout: Duration,
    interval: Duration,
    cancel_token: CancellationToken,
) {
    tracing::info!(target: TRACING_TARGET, "Starting heartbeat sweep loop");
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            biased;

            () = cancel_token.cancelled() => {
                tracing::info!(target: TRACING_TARGET, "Heartbeat sweep loop stopping");
                break;
            }

            _ = ticker.tick() => {
                manager.sweep_unresponsive_workers(timeout).await;
            }
        }
    }
}

//! HTTP listener startup and graceful shutdown, collapsed into one module
//! (no TLS surface — out of scope here) and extended with the
//! background-task and in-flight-worker teardown the manager needs on
//! shutdown.

use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal::ctrl_c;
#[cfg(unix)]
use tokio::signal::unix;

use crate::background::BackgroundTasks;
use crate::config::ManagerConfig;

const TRACING_TARGET: &str = "clusterrunner_manager::server";

/// Binds and serves `app`, running until a shutdown signal arrives, then
/// stops `background` and waits up to `config.shutdown_timeout()` for the
/// listener to drain in-flight requests.
pub async fn serve(app: Router, config: &ManagerConfig, background: BackgroundTasks) -> anyhow::Result<()> {
    let addr = config.socket_addr();
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(target: TRACING_TARGET, %addr, "Manager listening");

    let shutdown_timeout = config.shutdown_timeout();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!(
        target: TRACING_TARGET,
        timeout_secs = shutdown_timeout.as_secs(),
        "HTTP listener stopped, shutting down background tasks"
    );
    match tokio::time::timeout(shutdown_timeout, background.shutdown()).await {
        Ok(()) => {}
        Err(_) => {
            tracing::warn!(
                target: TRACING_TARGET,
                "Background tasks did not stop within the shutdown timeout"
            );
        }
    }

    Ok(())
}

/// Waits for SIGINT (Ctrl+C, all platforms) or SIGTERM (Unix).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = ctrl_c().await {
            tracing::error!(target: TRACING_TARGET, error = %err, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match unix::signal(unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(target: TRACING_TARGET, error = %err, "Failed to install SIGTERM handler");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!(target: TRACING_TARGET, "Shutdown signal received, draining connections");
}

/// Unused on its own but kept alongside `shutdown_signal` for symmetry with
/// workers, which expose the same constant for their suicide timer.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

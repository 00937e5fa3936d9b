//! HTTP listener startup and graceful shutdown. A worker's shutdown can be
//! triggered two ways: an OS signal (operator-initiated) or a `POST
//! /v1/kill` from the manager, both of which cancel the same
//! `AppState::kill_token`.

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal::ctrl_c;
#[cfg(unix)]
use tokio::signal::unix;
use tokio_util::sync::CancellationToken;

use crate::background::BackgroundTasks;
use crate::config::ExecutorConfig;

const TRACING_TARGET: &str = "clusterrunner_executor::server";

/// Binds and serves `app` until an OS signal or a kill request cancels
/// `kill_token`, then stops `background`.
pub async fn serve(app: Router, config: &ExecutorConfig, kill_token: CancellationToken, background: BackgroundTasks) -> anyhow::Result<()> {
    let addr = config.socket_addr();
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(target: TRACING_TARGET, %addr, "Worker listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(kill_token))
        .await?;

    tracing::info!(target: TRACING_TARGET, "HTTP listener stopped, shutting down background tasks");
    background.shutdown().await;

    Ok(())
}

/// Waits for SIGINT, SIGTERM (Unix), or the worker's own kill token being
/// cancelled by a `POST /v1/kill` handler.
async fn shutdown_signal(kill_token: CancellationToken) {
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
        () = kill_token.cancelled() => {},
    }

    tracing::info!(target: TRACING_TARGET, "Shutdown signal received, draining connections");
}

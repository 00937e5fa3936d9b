#![forbid(unsafe_code)]

//! Manager binary entrypoint.

use std::process;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use clap::Parser;
use clusterrunner_manager::background::BackgroundTasks;
use clusterrunner_manager::config::{ManagerConfig, log_manager_config};
use clusterrunner_manager::state::AppState;
use clusterrunner_manager::{handlers, server};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const TRACING_TARGET_STARTUP: &str = "clusterrunner_manager::startup";
const TRACING_TARGET_SHUTDOWN: &str = "clusterrunner_manager::shutdown";

#[derive(Parser, Debug)]
#[command(name = "clusterrunner-manager", version, about = "ClusterRunner manager process")]
struct Cli {
    #[command(flatten)]
    manager: ManagerConfig,
}

#[tokio::main]
async fn main() {
    #[cfg(feature = "dotenv")]
    if let Err(err) = dotenvy::dotenv() {
        eprintln!("no .env file loaded: {err}");
    }

    let Err(error) = run().await else {
        tracing::info!(target: TRACING_TARGET_SHUTDOWN, "manager terminated successfully");
        process::exit(0);
    };

    if tracing::enabled!(tracing::Level::ERROR) {
        tracing::error!(target: TRACING_TARGET_SHUTDOWN, error = %error, "manager terminated with error");
    } else {
        eprintln!("Error: {error:#}");
    }
    process::exit(1);
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing();
    log_startup_info();
    log_manager_config(&cli.manager);

    cli.manager.validate().context("invalid manager configuration")?;

    let state = AppState::new(cli.manager.clone());
    let background = BackgroundTasks::spawn(
        state.allocator.clone(),
        state.manager.clone(),
        cli.manager.heartbeat_timeout(),
        cli.manager.heartbeat_sweep_interval(),
    );

    let router = create_router(state);

    server::serve(router, &cli.manager, background).await?;

    Ok(())
}

/// Assembles the router: routes plus a tracing span per request and a
/// blanket request timeout.
fn create_router(state: AppState) -> Router {
    handlers::routes(state)
        .layer(TimeoutLayer::new(Duration::from_secs(60)))
        .layer(TraceLayer::new_for_http())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn log_startup_info() {
    tracing::info!(
        target: TRACING_TARGET_STARTUP,
        version = env!("CARGO_PKG_VERSION"),
        "starting clusterrunner-manager"
    );
    tracing::debug!(
        target: TRACING_TARGET_STARTUP,
        pid = process::id(),
        arch = std::env::consts::ARCH,
        os = std::env::consts::OS,
        "process info"
    );
}

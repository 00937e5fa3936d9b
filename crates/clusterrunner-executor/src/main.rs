#![forbid(unsafe_code)]

//! Worker binary entrypoint.

use std::process;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use clap::Parser;
use clusterrunner_executor::background::BackgroundTasks;
use clusterrunner_executor::client::ManagerClient;
use clusterrunner_executor::config::{ExecutorConfig, log_executor_config};
use clusterrunner_executor::state::AppState;
use clusterrunner_executor::{handlers, server};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const TRACING_TARGET_STARTUP: &str = "clusterrunner_executor::startup";
const TRACING_TARGET_SHUTDOWN: &str = "clusterrunner_executor::shutdown";

#[derive(Parser, Debug)]
#[command(name = "clusterrunner-executor", version, about = "ClusterRunner worker process")]
struct Cli {
    #[command(flatten)]
    executor: ExecutorConfig,
}

#[tokio::main]
async fn main() {
    #[cfg(feature = "dotenv")]
    if let Err(err) = dotenvy::dotenv() {
        eprintln!("no .env file loaded: {err}");
    }

    let Err(error) = run().await else {
        tracing::info!(target: TRACING_TARGET_SHUTDOWN, "worker terminated successfully");
        process::exit(0);
    };

    if tracing::enabled!(tracing::Level::ERROR) {
        tracing::error!(target: TRACING_TARGET_SHUTDOWN, error = %error, "worker terminated with error");
    } else {
        eprintln!("Error: {error:#}");
    }
    process::exit(1);
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing();
    log_startup_info();
    log_executor_config(&cli.executor);

    cli.executor.validate().context("invalid worker configuration")?;

    let session_id = uuid::Uuid::new_v4().to_string();
    let manager_client = ManagerClient::new(
        cli.executor.manager_url.clone(),
        cli.executor.hmac_secret.clone(),
        cli.executor.manager_rpc_timeout(),
    );

    let worker_id = manager_client
        .register(&cli.executor.advertised_url(), cli.executor.num_executors, &session_id)
        .await
        .context("failed to register with manager")?;

    let state = AppState::new(cli.executor.clone(), manager_client, worker_id, session_id.clone());
    let kill_token = state.kill_token.clone();
    let background = BackgroundTasks::spawn(state.manager.clone(), worker_id, cli.executor.heartbeat_interval(), kill_token.clone());

    let router = create_router(state);

    server::serve(router, &cli.executor, kill_token, background).await?;

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
        "starting clusterrunner-executor"
    );
    tracing::debug!(
        target: TRACING_TARGET_STARTUP,
        pid = process::id(),
        arch = std::env::consts::ARCH,
        os = std::env::consts::OS,
        "process info"
    );
}

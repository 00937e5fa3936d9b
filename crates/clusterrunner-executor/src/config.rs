//! Executor process configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use serde::{Deserialize, Serialize};

const TRACING_TARGET: &str = "clusterrunner_executor::config";

/// Default number of local concurrent execution slots.
pub const DEFAULT_NUM_EXECUTORS: u32 = 4;

/// Executor process configuration.
///
/// # Environment Variables
///
/// - `HOST` / `PORT` — bind address for this worker's own HTTP server
/// - `WORKER_URL` — the address this worker advertises to the manager
///   (must be reachable from it; defaults to `http://{HOST}:{PORT}`)
/// - `MANAGER_URL` — base URL of the manager this worker registers with
/// - `CLUSTERRUNNER_SECRET` — shared HMAC secret, matching the manager's
/// - `NUM_EXECUTORS` — local concurrency (default 4)
/// - `CLUSTERRUNNER_ARTIFACT_DIR` — scratch directory for in-progress atom
///   artifacts before they're archived and reported
/// - `HEARTBEAT_INTERVAL_SECS` — how often this worker pings the manager
#[derive(Debug, Clone, Args, Serialize, Deserialize)]
#[must_use = "config does nothing unless you use it"]
pub struct ExecutorConfig {
    /// Host address to bind this worker's HTTP server to.
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// TCP port for this worker's HTTP server.
    #[arg(short = 'p', long, env = "PORT", default_value_t = 43001)]
    pub port: u16,

    /// URL this worker advertises to the manager. Defaults to
    /// `http://{host}:{port}` when unset.
    #[arg(long, env = "WORKER_URL")]
    pub worker_url: Option<String>,

    /// Base URL of the manager to register with.
    #[arg(long, env = "MANAGER_URL")]
    pub manager_url: String,

    /// Shared secret used to sign and verify manager<->worker requests.
    #[arg(long, env = "CLUSTERRUNNER_SECRET")]
    pub hmac_secret: String,

    /// Number of subjobs this worker can execute concurrently.
    #[arg(long, env = "NUM_EXECUTORS", default_value_t = DEFAULT_NUM_EXECUTORS)]
    #[serde(default = "default_num_executors")]
    pub num_executors: u32,

    /// Directory where in-progress atom artifacts and subjob archives are
    /// written before being reported to the manager.
    #[arg(long, env = "CLUSTERRUNNER_ARTIFACT_DIR", default_value = "/tmp/clusterrunner/worker")]
    pub artifact_dir: PathBuf,

    /// Interval, in seconds, between heartbeats sent to the manager.
    #[arg(long, env = "HEARTBEAT_INTERVAL_SECS", default_value_t = 10)]
    pub heartbeat_interval_secs: u64,

    /// Per-RPC timeout, in seconds, for worker-to-manager requests.
    #[arg(long, env = "MANAGER_RPC_TIMEOUT_SECS", default_value_t = 30)]
    pub manager_rpc_timeout_secs: u64,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_num_executors() -> u32 {
    DEFAULT_NUM_EXECUTORS
}

impl ExecutorConfig {
    #[must_use]
    pub const fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// The URL this worker reports to the manager on connect.
    #[must_use]
    pub fn advertised_url(&self) -> String {
        self.worker_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.host, self.port))
    }

    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    #[must_use]
    pub const fn manager_rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.manager_rpc_timeout_secs)
    }

    /// Validates configuration values that `clap` can't express in its own
    /// attributes.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.hmac_secret.is_empty() {
            anyhow::bail!("CLUSTERRUNNER_SECRET must not be empty");
        }
        if self.manager_url.is_empty() {
            anyhow::bail!("MANAGER_URL must not be empty");
        }
        if self.num_executors == 0 {
            anyhow::bail!("NUM_EXECUTORS must be greater than zero");
        }
        Ok(())
    }
}

/// Logs executor configuration details, omitting the HMAC secret.
pub fn log_executor_config(config: &ExecutorConfig) {
    tracing::info!(
        target: TRACING_TARGET,
        host = %config.host,
        port = config.port,
        manager_url = %config.manager_url,
        num_executors = config.num_executors,
        artifact_dir = %config.artifact_dir.display(),
        "Executor configured"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ExecutorConfig {
        ExecutorConfig {
            host: default_host(),
            port: 43001,
            worker_url: None,
            manager_url: "http://127.0.0.1:43000".to_string(),
            hmac_secret: "secret".to_string(),
            num_executors: 4,
            artifact_dir: PathBuf::from("/tmp/clusterrunner-test/worker"),
            heartbeat_interval_secs: 10,
            manager_rpc_timeout_secs: 30,
        }
    }

    #[test]
    fn validate_accepts_a_well_formed_config() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_executors() {
        let mut c = config();
        c.num_executors = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn advertised_url_falls_back_to_host_and_port() {
        let c = config();
        assert_eq!(c.advertised_url(), "http://127.0.0.1:43001");
    }

    #[test]
    fn advertised_url_prefers_the_explicit_override() {
        let mut c = config();
        c.worker_url = Some("http://worker-7.internal:43001".to_string());
        assert_eq!(c.advertised_url(), "http://worker-7.internal:43001");
    }
}

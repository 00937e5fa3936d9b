//! Manager process configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use serde::{Deserialize, Serialize};

const TRACING_TARGET: &str = "clusterrunner_manager::config";

/// Manager process configuration.
///
/// # Environment Variables
///
/// - `HOST` / `PORT` — bind address (default `127.0.0.1:43000`)
/// - `CLUSTERRUNNER_SECRET` — shared HMAC secret for manager<->worker RPCs
/// - `CLUSTERRUNNER_RESULTS_DIR` — where per-build artifact directories land
/// - `HEARTBEAT_TIMEOUT_SECS` / `HEARTBEAT_SWEEP_INTERVAL_SECS` — worker
///   liveness sweep tuning
/// - `DISPATCH_POOL_SIZE` — bounded pool size for subjob-result ingestion
/// - `WORKER_RPC_TIMEOUT_SECS` — per-RPC timeout against worker processes
#[derive(Debug, Clone, Args, Serialize, Deserialize)]
#[must_use = "config does nothing unless you use it"]
pub struct ManagerConfig {
    /// Host address to bind the manager's HTTP server to.
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// TCP port for the manager's HTTP server.
    #[arg(short = 'p', long, env = "PORT", default_value_t = 43000)]
    pub port: u16,

    /// Shared secret used to sign and verify manager<->worker requests.
    #[arg(long, env = "CLUSTERRUNNER_SECRET")]
    pub hmac_secret: String,

    /// Directory under which per-build artifact directories and result
    /// archives are written.
    #[arg(long, env = "CLUSTERRUNNER_RESULTS_DIR", default_value = "/tmp/clusterrunner/results")]
    pub results_dir: PathBuf,

    /// Seconds since a worker's last heartbeat before it is considered
    /// unresponsive and marked dead.
    #[arg(long, env = "HEARTBEAT_TIMEOUT_SECS", default_value_t = 30)]
    pub heartbeat_timeout_secs: u64,

    /// Interval, in seconds, between heartbeat sweep passes.
    #[arg(long, env = "HEARTBEAT_SWEEP_INTERVAL_SECS", default_value_t = 10)]
    pub heartbeat_sweep_interval_secs: u64,

    /// Size of the bounded task pool handling subjob-result ingestion.
    #[arg(long, env = "DISPATCH_POOL_SIZE", default_value_t = 32)]
    pub dispatch_pool_size: usize,

    /// Per-RPC timeout, in seconds, for manager-to-worker requests.
    #[arg(long, env = "WORKER_RPC_TIMEOUT_SECS", default_value_t = 30)]
    pub worker_rpc_timeout_secs: u64,

    /// Maximum time in seconds to wait for graceful shutdown.
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 30)]
    pub shutdown_timeout_secs: u64,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

impl ManagerConfig {
    /// Returns the complete socket address for server binding.
    #[must_use]
    pub const fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    #[must_use]
    pub const fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    #[must_use]
    pub const fn heartbeat_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_sweep_interval_secs)
    }

    #[must_use]
    pub const fn worker_rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_rpc_timeout_secs)
    }

    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Validates configuration values that `clap` can't express in its own
    /// attributes.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.hmac_secret.is_empty() {
            anyhow::bail!("CLUSTERRUNNER_SECRET must not be empty");
        }
        if self.heartbeat_timeout_secs == 0 {
            anyhow::bail!("heartbeat timeout must be greater than zero");
        }
        Ok(())
    }
}

/// Logs manager configuration details, omitting the HMAC secret.
pub fn log_manager_config(config: &ManagerConfig) {
    tracing::info!(
        target: TRACING_TARGET,
        host = %config.host,
        port = config.port,
        results_dir = %config.results_dir.display(),
        heartbeat_timeout_secs = config.heartbeat_timeout_secs,
        dispatch_pool_size = config.dispatch_pool_size,
        "Manager configured"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ManagerConfig {
        ManagerConfig {
            host: default_host(),
            port: 43000,
            hmac_secret: "secret".to_string(),
            results_dir: PathBuf::from("/tmp/clusterrunner-test/results"),
            heartbeat_timeout_secs: 30,
            heartbeat_sweep_interval_secs: 10,
            dispatch_pool_size: 32,
            worker_rpc_timeout_secs: 30,
            shutdown_timeout_secs: 30,
        }
    }

    #[test]
    fn validate_accepts_a_well_formed_config() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_secret() {
        let mut c = config();
        c.hmac_secret = String::new();
        assert!(c.validate().is_err());
    }

    #[test]
    fn socket_addr_combines_host_and_port() {
        let c = config();
        assert_eq!(c.socket_addr().port(), 43000);
    }
}

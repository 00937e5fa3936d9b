//! `GET /v1` (liveness probe) and `POST /v1/kill` (graceful shutdown
//! request) — the two endpoints the manager uses to supervise a worker's
//! lifecycle rather than drive a build through it.

use std::time::Duration;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use clusterrunner_wire::dto::{IsAliveDto, WorkerStateDto};

use super::verify_signature;
use crate::error::Result;
use crate::state::AppState;

const TRACING_TARGET: &str = "clusterrunner_executor::handlers::kill";

/// Shutdown grace period: how long `post_kill` waits for the process to
/// exit on its own (last subjob finishing, graceful server shutdown)
/// before forcing it.
const SUICIDE_GRACE: Duration = Duration::from_secs(30);

/// Unsigned: the manager polls this to confirm it is still talking to
/// the same worker process (session ids change across restarts), and a
/// dead worker can't be expected to sign anything.
pub async fn get_is_alive(State(state): State<AppState>) -> Json<IsAliveDto> {
    Json(IsAliveDto {
        session_id: state.session_id.to_string(),
    })
}

pub async fn post_kill(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<StatusCode> {
    verify_signature(&headers, &body, &state.config.hmac_secret)?;

    tracing::warn!(target: TRACING_TARGET, worker_id = state.worker_id, "Kill requested, shutting down");
    state.begin_shutdown();
    state.kill_token.cancel();

    if let Err(err) = state.manager.report_state(state.worker_id, WorkerStateDto::Disconnected, None).await {
        tracing::warn!(target: TRACING_TARGET, error = %err, "Failed to report disconnect before shutdown");
    }

    tokio::spawn(async move {
        tokio::time::sleep(SUICIDE_GRACE).await;
        tracing::error!(target: TRACING_TARGET, "Shutdown grace period elapsed, forcing exit");
        std::process::exit(1);
    });

    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State as AxumState;

    fn state() -> AppState {
        let config = crate::config::ExecutorConfig {
            host: std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            port: 0,
            worker_url: None,
            manager_url: "http://127.0.0.1:0".to_string(),
            hmac_secret: "secret".to_string(),
            num_executors: 1,
            artifact_dir: std::env::temp_dir(),
            heartbeat_interval_secs: 10,
            manager_rpc_timeout_secs: 30,
        };
        let manager = crate::client::ManagerClient::new("http://127.0.0.1:0", "secret", Duration::from_secs(1));
        AppState::new(config, manager, 7, "session-a".to_string())
    }

    #[tokio::test]
    async fn get_is_alive_reports_this_processs_session_id() {
        let Json(body) = get_is_alive(AxumState(state())).await;
        assert_eq!(body.session_id, "session-a");
    }

    #[tokio::test]
    async fn post_kill_rejects_an_unsigned_request() {
        let state = state();
        let err = post_kill(AxumState(state.clone()), HeaderMap::new(), Bytes::new()).await.unwrap_err();
        assert!(!state.is_shutting_down());
        assert!(matches!(err, crate::error::ExecutorError::Auth(_)));
    }
}

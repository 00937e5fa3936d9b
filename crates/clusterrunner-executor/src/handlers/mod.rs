//! All axum routes exposed by the worker process, matching the paths
//! `clusterrunner-manager`'s `ReqwestWorkerTransport` calls out to.

mod build;
mod kill;

use axum::Router;
use axum::body::Bytes;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use clusterrunner_wire::auth::{self, DIGEST_HEADER};

use crate::error::{ExecutorError, Result};
use crate::state::AppState;

pub use build::{post_setup, post_subjob, post_teardown};
pub use kill::{get_is_alive, post_kill};

const TRACING_TARGET: &str = "clusterrunner_executor::handlers";

/// Verifies the HMAC digest the manager signed the request body with.
/// Every worker-facing endpoint except the plain liveness probe goes
/// through this first.
fn verify_signature(headers: &HeaderMap, body: &[u8], secret: &str) -> Result<()> {
    let digest = headers
        .get(DIGEST_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ExecutorError::auth("missing digest header"))?;

    if !auth::verify(body, secret, digest) {
        tracing::warn!(target: TRACING_TARGET, "Rejected request with invalid signature");
        return Err(ExecutorError::auth("invalid request signature"));
    }
    Ok(())
}

fn parse_signed_json<T: serde::de::DeserializeOwned>(headers: &HeaderMap, body: Bytes, secret: &str) -> Result<T> {
    verify_signature(headers, &body, secret)?;
    serde_json::from_slice(&body).map_err(|e| ExecutorError::config(format!("malformed request body: {e}")))
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1", get(get_is_alive))
        .route("/v1/kill", post(post_kill))
        .route("/v1/build/{build_id}/setup", post(post_setup))
        .route("/v1/build/{build_id}/teardown", post(post_teardown))
        .route("/v1/build/{build_id}/subjob/{subjob_id}", post(post_subjob))
        .with_state(state)
}

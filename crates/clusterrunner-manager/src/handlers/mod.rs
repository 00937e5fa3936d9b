//! All axum routes exposed by the manager process: the build submission
//! surface consumed by operators/CLIs, and the worker-facing surface
//! consumed by `clusterrunner-executor` processes.

mod build;
mod worker;

use axum::Router;
use axum::body::{Body, Bytes, to_bytes};
use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use clusterrunner_wire::auth::{self, DIGEST_HEADER};

use crate::error::ManagerError;
use crate::state::AppState;

pub use build::{cancel_build, get_build, post_build, post_subjob_result};
pub use worker::{post_worker, post_worker_heartbeat, post_worker_state};

const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

async fn health() -> &'static str {
    "ok"
}

/// Verifies the HMAC digest a worker process signed the request body
/// with. Buffers the body (workers never send large enough payloads to
/// make this costly — archives ride inside a signed JSON envelope) and
/// reinserts it unread so the downstream handler's extractor still works.
async fn verify_worker_signature(State(state): State<AppState>, request: Request, next: Next) -> Result<Response, ManagerError> {
    let (parts, body) = request.into_parts();
    let digest = parts
        .headers
        .get(DIGEST_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ManagerError::auth("missing digest header"))?
        .to_string();

    let bytes: Bytes = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| ManagerError::config(format!("failed to read request body: {e}")))?;

    if !auth::verify(&bytes, &state.config.hmac_secret, &digest) {
        tracing::warn!(target: "clusterrunner_manager::handlers", "Rejected worker request with invalid signature");
        return Err(ManagerError::auth("invalid request signature"));
    }

    let request = Request::from_parts(parts, Body::from(bytes));
    Ok(next.run(request).await)
}

/// Builds the manager's router. `/worker*` and
/// `/build/{id}/subjob/{id}/result` are called by worker processes and
/// carry the signed wire protocol; `/build`, `/build/{id}` and
/// `/build/{id}/cancel` are the operator-facing submission surface and
/// are not signed.
pub fn routes(state: AppState) -> Router {
    let worker_facing = Router::new()
        .route(
            "/build/{build_id}/subjob/{subjob_id}/result",
            post(post_subjob_result),
        )
        .route("/worker", post(post_worker))
        .route("/worker/{worker_id}/state", post(post_worker_state))
        .route("/worker/{worker_id}/heartbeat", post(post_worker_heartbeat))
        .route_layer(middleware::from_fn_with_state(state.clone(), verify_worker_signature));

    Router::new()
        .route("/health", get(health))
        .route("/build", post(post_build))
        .route("/build/{build_id}", get(get_build))
        .route("/build/{build_id}/cancel", post(cancel_build))
        .merge(worker_facing)
        .with_state(state)
}

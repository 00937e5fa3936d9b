//! `POST /worker`, `POST /worker/{id}/state`, `POST /worker/{id}/heartbeat`.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use clusterrunner_core::manager::WorkerStateUpdate;
use clusterrunner_wire::dto::{ConnectWorkerDto, ConnectWorkerResponseDto, WorkerStateDto, WorkerStateUpdateDto};

use crate::error::Result;
use crate::state::AppState;

const TRACING_TARGET: &str = "clusterrunner_manager::handlers::worker";

pub async fn post_worker(
    State(state): State<AppState>,
    Json(request): Json<ConnectWorkerDto>,
) -> Result<Json<ConnectWorkerResponseDto>> {
    let worker_id = state.allocate_worker_id();
    tracing::info!(
        target: TRACING_TARGET,
        worker_id,
        url = %request.worker_url,
        num_executors = request.num_executors,
        "Worker connecting"
    );
    state
        .manager
        .connect_worker(
            worker_id,
            request.worker_url,
            request.num_executors,
            request.session_id,
            state.transport.clone(),
        )
        .await;
    Ok(Json(ConnectWorkerResponseDto { worker_id }))
}

pub async fn post_worker_state(
    State(state): State<AppState>,
    Path(worker_id): Path<u32>,
    Json(request): Json<WorkerStateUpdateDto>,
) -> Result<StatusCode> {
    let update = match request.state {
        WorkerStateDto::Idle => WorkerStateUpdate::Idle,
        WorkerStateDto::Disconnected => WorkerStateUpdate::Disconnected,
        WorkerStateDto::Shutdown => WorkerStateUpdate::Shutdown,
        WorkerStateDto::SetupCompleted => WorkerStateUpdate::SetupCompleted,
        WorkerStateDto::SetupFailed => WorkerStateUpdate::SetupFailed,
    };

    let allocator = state.allocator.clone();
    state
        .manager
        .handle_worker_state_update(worker_id, update, async move |worker| {
            allocator.add_idle_worker(worker).await;
        })
        .await?;

    if matches!(update, WorkerStateUpdate::SetupCompleted)
        && let Some(build_id) = request.build_id
        && let Some(scheduler) = state.manager.scheduler_pool.get(build_id).await
        && let Ok(worker) = state.manager.registry.get_by_id(worker_id).await
    {
        scheduler.begin_subjob_executions_on_worker(worker).await;
    }

    Ok(StatusCode::OK)
}

pub async fn post_worker_heartbeat(
    State(state): State<AppState>,
    Path(worker_id): Path<u32>,
) -> Result<StatusCode> {
    state.manager.update_worker_last_heartbeat_time(worker_id).await?;
    Ok(StatusCode::OK)
}

//! `POST /build`, `GET /build/{id}`, `POST /build/{id}/cancel` and the
//! subjob-result ingestion endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use clusterrunner_core::build::Build;
use clusterrunner_core::project_type::ProjectType;
use clusterrunner_core::request_handler::prepare_build;
use clusterrunner_core::scheduler::BuildScheduler;
use clusterrunner_wire::dto::{BuildRequestDto, BuildRequestResponseDto, BuildStatusDto, SubjobResultDto};
use std::sync::atomic::AtomicBool;

use crate::error::{ManagerError, Result};
use crate::project_type::DirectoryProjectParams;
use crate::state::AppState;

const TRACING_TARGET: &str = "clusterrunner_manager::handlers::build";

/// Submits a new build request. Only the `"directory"` project type is
/// implemented by this binary (see [`crate::project_type::DirectoryProjectType`]).
pub async fn post_build(
    State(state): State<AppState>,
    Json(request): Json<BuildRequestDto>,
) -> Result<Json<BuildRequestResponseDto>> {
    if request.project_type != "directory" {
        return Err(ManagerError::config(format!(
            "unsupported project_type '{}', only 'directory' is implemented",
            request.project_type
        )));
    }
    let params: DirectoryProjectParams = serde_json::from_value(request.project_params)
        .map_err(|e| ManagerError::config(format!("malformed project_params: {e}")))?;

    let build_id = state.manager.register_build(jiff::Timestamp::now()).await;
    state
        .record_project_directory(build_id, std::path::PathBuf::from(&params.project_directory))
        .await;

    tracing::info!(target: TRACING_TARGET, build_id, project_directory = %params.project_directory, "Build requested");

    tokio::spawn(prepare_and_schedule(state, build_id, params));

    Ok(Json(BuildRequestResponseDto { build_id }))
}

/// Runs build preparation on its own task, serialized per project id,
/// then registers the resulting scheduler with the allocator pool.
async fn prepare_and_schedule(state: AppState, build_id: u32, params: DirectoryProjectParams) {
    let project = crate::project_type::DirectoryProjectType::from_params(
        params,
        state.config.results_dir.join("_timings"),
    );
    let project_lock = state.preparation_locks.lock_for(&project.project_id()).await;
    let _guard = project_lock.lock().await;

    let build_arc = match state.manager.get_build(build_id).await {
        Ok(build) => build,
        Err(err) => {
            tracing::error!(target: TRACING_TARGET, build_id, error = %err, "Build vanished before preparation");
            return;
        }
    };

    let artifacts_root = state.config.results_dir.clone();
    let prepared = {
        let mut build = build_arc.lock().await;
        prepare_build(&mut build, &project, &artifacts_root).await
    };

    if let Err(err) = prepared {
        tracing::warn!(target: TRACING_TARGET, build_id, error = %err, "Build preparation failed");
        return;
    }

    let scheduler = {
        let mut build = build_arc.lock().await;
        if build.start_building().is_err() {
            tracing::warn!(
                target: TRACING_TARGET,
                build_id,
                state = ?build.state,
                "Build was canceled during preparation, not scheduling"
            );
            return;
        }
        let job_config = build
            .job_config
            .as_ref()
            .expect("prepare_build always sets job_config on success");
        Arc::new(BuildScheduler::new(
            build_id,
            build.subjobs.clone(),
            job_config.command.clone(),
            project.project_directory().display().to_string(),
            job_config.setup_build.clone(),
            job_config.teardown_build.clone(),
            job_config.max_executors,
            job_config.max_executors_per_worker,
            Arc::new(AtomicBool::new(build.is_canceled())),
        ))
    };

    state.manager.scheduler_pool.add_scheduler(scheduler).await;
    tracing::info!(target: TRACING_TARGET, build_id, "Build prepared and queued for workers");
}

pub async fn get_build(
    State(state): State<AppState>,
    Path(build_id): Path<u32>,
) -> Result<Json<BuildStatusDto>> {
    let build = state.manager.get_build(build_id).await?;
    let build = build.lock().await;
    Ok(Json(to_status_dto(&build)))
}

pub async fn cancel_build(
    State(state): State<AppState>,
    Path(build_id): Path<u32>,
) -> Result<Json<BuildStatusDto>> {
    state.manager.handle_request_to_update_build(build_id).await?;
    let build = state.manager.get_build(build_id).await?;
    let build = build.lock().await;
    Ok(Json(to_status_dto(&build)))
}

fn to_status_dto(build: &Build) -> BuildStatusDto {
    BuildStatusDto {
        build_id: build.id,
        state: format!("{:?}", build.state).to_uppercase(),
        error_message: build.error_message.clone(),
    }
}

/// Worker reports a completed subjob: unpacks the reported archive into the
/// build's artifact directory, recovers per-atom timings from the
/// now-on-disk timing files, and routes the result through the manager
/// facade.
pub async fn post_subjob_result(
    State(state): State<AppState>,
    Path((build_id, subjob_id)): Path<(u32, u32)>,
    Json(result): Json<SubjobResultDto>,
) -> Result<()> {
    let archive_bytes = BASE64
        .decode(result.archive_base64.as_bytes())
        .map_err(|e| ManagerError::config(format!("malformed archive_base64: {e}")))?;

    let artifact_dir = state.artifact_dir(build_id);
    unpack_archive(&artifact_dir, archive_bytes)
        .await
        .map_err(|e| ManagerError::io("failed to unpack subjob result archive", e))?;

    let project_directory = state
        .project_directory(build_id)
        .await
        .ok_or_else(|| ManagerError::config(format!("no project directory recorded for build {build_id}")))?;

    let build_arc = state.manager.get_build(build_id).await?;
    let timings = {
        let mut build = build_arc.lock().await;
        let subjob = build
            .subjobs
            .iter_mut()
            .find(|s| s.subjob_id == subjob_id)
            .ok_or_else(|| clusterrunner_core::Error::not_found(format!("build {build_id} has no subjob {subjob_id}")))?;
        subjob.read_timings(&artifact_dir, &project_directory)
    };

    let scheduler = state
        .manager
        .scheduler_pool
        .get(build_id)
        .await
        .ok_or_else(|| ManagerError::config(format!("no scheduler registered for build {build_id}")))?;
    let worker = state.manager.registry.get_by_id(result.worker_id).await?;

    state
        .manager
        .handle_result_reported_from_worker(build_arc, subjob_id, timings, scheduler, worker)
        .await?;

    tracing::debug!(
        target: TRACING_TARGET,
        build_id,
        subjob_id,
        atom_count = result.atom_exit_codes.len(),
        "Recorded subjob result"
    );

    Ok(())
}

async fn unpack_archive(artifact_dir: &std::path::Path, bytes: Vec<u8>) -> std::io::Result<()> {
    let dir = artifact_dir.to_path_buf();
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        std::fs::create_dir_all(&dir)?;
        let decoder = flate2::read::GzDecoder::new(std::io::Cursor::new(bytes));
        let mut archive = tar::Archive::new(decoder);
        archive.unpack(&dir)
    })
    .await
    .map_err(|e| std::io::Error::other(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_status_dto_uppercases_the_state_name() {
        let build = Build::new(1, jiff::Timestamp::UNIX_EPOCH);
        let dto = to_status_dto(&build);
        assert_eq!(dto.state, "QUEUED");
    }
}

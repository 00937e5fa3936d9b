//! `POST /v1/build/{id}/setup`, `POST /v1/build/{id}/subjob/{sid}`,
//! `POST /v1/build/{id}/teardown`: the three RPCs the manager drives a
//! worker's build lifecycle with.

use std::path::{Path, PathBuf};

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path as AxumPath, State};
use axum::http::HeaderMap;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use clusterrunner_core::subjob::{ATOM_DIR_FORMAT, EXIT_CODE_FILE, TIMING_FILE};
use clusterrunner_wire::dto::{SetupBuildDto, StartSubjobDto, SubjobResultDto, TeardownBuildDto, WorkerStateDto};
use serde::Serialize;
use tokio::process::Command;

use super::parse_signed_json;
use crate::error::{ExecutorError, Result};
use crate::state::AppState;

const TRACING_TARGET: &str = "clusterrunner_executor::handlers::build";

#[derive(Serialize)]
pub struct StartSubjobResponse {
    executor_id: u32,
}

pub async fn post_setup(
    State(state): State<AppState>,
    AxumPath(build_id): AxumPath<u32>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<()> {
    let dto: SetupBuildDto = parse_signed_json(&headers, body, &state.config.hmac_secret)?;
    if dto.build_id != build_id {
        return Err(ExecutorError::config("build id in path does not match body"));
    }
    if state.is_shutting_down() {
        return Err(ExecutorError::manager("worker is shutting down, rejecting new build"));
    }

    let project_directory = PathBuf::from(&dto.project_directory);
    state
        .set_current_build(Some(build_id), Some(project_directory.clone()))
        .await;

    tracing::info!(
        target: TRACING_TARGET,
        build_id,
        executor_start_index = dto.executor_start_index,
        "Setting up build"
    );

    tokio::spawn(run_setup(state, dto, project_directory));
    Ok(())
}

/// Runs the build's `setup_build` command (if any) and reports the
/// outcome back to the manager. Off the request task so `post_setup`
/// returns promptly, matching the manager's "200 on accepted" contract.
async fn run_setup(state: AppState, dto: SetupBuildDto, project_directory: PathBuf) {
    let outcome = match dto.setup_build.as_deref() {
        Some(command) => run_shell_in_dir(command, &project_directory).await,
        None => Ok(()),
    };

    let report = match &outcome {
        Ok(()) => WorkerStateDto::SetupCompleted,
        Err(err) => {
            tracing::warn!(target: TRACING_TARGET, build_id = dto.build_id, error = %err, "setup_build failed");
            WorkerStateDto::SetupFailed
        }
    };

    if let Err(err) = state.manager.report_state(state.worker_id, report, Some(dto.build_id)).await {
        tracing::error!(target: TRACING_TARGET, build_id = dto.build_id, error = %err, "Failed to report setup outcome to manager");
    }
}

pub async fn post_teardown(
    State(state): State<AppState>,
    AxumPath(build_id): AxumPath<u32>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<()> {
    let dto: TeardownBuildDto = parse_signed_json(&headers, body, &state.config.hmac_secret)?;
    if dto.build_id != build_id {
        return Err(ExecutorError::config("build id in path does not match body"));
    }

    if let Some(command) = dto.teardown_build.as_deref() {
        let project_directory = state.current_project_directory().await.unwrap_or_default();
        if let Err(err) = run_shell_in_dir(command, &project_directory).await {
            tracing::warn!(target: TRACING_TARGET, build_id, error = %err, "teardown_build failed, tearing down anyway");
        }
    }

    state.set_current_build(None, None).await;
    tracing::info!(target: TRACING_TARGET, build_id, "Build torn down");
    Ok(())
}

pub async fn post_subjob(
    State(state): State<AppState>,
    AxumPath((build_id, subjob_id)): AxumPath<(u32, u32)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<StartSubjobResponse>> {
    let dto: StartSubjobDto = parse_signed_json(&headers, body, &state.config.hmac_secret)?;
    if dto.build_id != build_id || dto.subjob_id != subjob_id {
        return Err(ExecutorError::config("build/subjob id in path does not match body"));
    }
    if state.is_shutting_down() {
        return Err(ExecutorError::manager("worker is shutting down, rejecting new subjob"));
    }

    let slot_id = state.slots.acquire().await;
    tracing::info!(
        target: TRACING_TARGET,
        build_id,
        subjob_id,
        slot_id,
        atom_count = dto.atomic_commands.len(),
        "Subjob assigned"
    );

    tokio::spawn(run_subjob(state, dto, slot_id));

    Ok(Json(StartSubjobResponse { executor_id: slot_id }))
}

/// Executes a subjob's atoms on the slot already acquired by
/// [`post_subjob`], then reports the result (or logs and gives up on
/// failure — there is no manager-side requeue for a subjob a worker never
/// manages to report back).
async fn run_subjob(state: AppState, dto: StartSubjobDto, slot_id: u32) {
    let executor = state.executor_for_slot(slot_id);
    let outcome = executor
        .execute_subjob(dto.build_id, dto.subjob_id, &dto.atomic_commands, dto.base_executor_index, &state.kill_token)
        .await;
    state.slots.release(slot_id);

    if let Err(err) = outcome {
        tracing::warn!(target: TRACING_TARGET, build_id = dto.build_id, subjob_id = dto.subjob_id, error = %err, "Subjob execution failed");
        return;
    }

    let result = match collect_subjob_result(&state, dto.build_id, dto.subjob_id, dto.atomic_commands.len()).await {
        Ok(result) => result,
        Err(err) => {
            tracing::error!(target: TRACING_TARGET, build_id = dto.build_id, subjob_id = dto.subjob_id, error = %err, "Failed to collect subjob result");
            return;
        }
    };

    if let Err(err) = state.manager.report_subjob_result(dto.build_id, &result).await {
        tracing::error!(target: TRACING_TARGET, build_id = dto.build_id, subjob_id = dto.subjob_id, error = %err, "Failed to report subjob result to manager");
    }
}

/// Reads back each atom's exit code and timing and base64-encodes the
/// archive [`clusterrunner_core::executor::SubjobExecutor`] produced.
async fn collect_subjob_result(state: &AppState, build_id: u32, subjob_id: u32, atom_count: usize) -> Result<SubjobResultDto> {
    let subjob_dir = state.config.artifact_dir.join(build_id.to_string());
    let mut atom_exit_codes = Vec::with_capacity(atom_count);
    let mut atom_timings = Vec::with_capacity(atom_count);

    for atom_id in 0..atom_count as u32 {
        let atom_dir = subjob_dir.join(format!("{ATOM_DIR_FORMAT}_{subjob_id}_{atom_id}"));
        let exit_code = tokio::fs::read_to_string(atom_dir.join(EXIT_CODE_FILE))
            .await
            .ok()
            .and_then(|s| s.trim().parse::<i32>().ok())
            .unwrap_or(-1);
        let timing = tokio::fs::read_to_string(atom_dir.join(TIMING_FILE))
            .await
            .ok()
            .and_then(|s| s.trim().parse::<f64>().ok())
            .unwrap_or(0.0);
        atom_exit_codes.push(exit_code);
        atom_timings.push(timing);
    }

    let archive_path = subjob_dir.join(format!("results_{subjob_id}.tar.gz"));
    let archive_bytes = tokio::fs::read(&archive_path)
        .await
        .map_err(|e| ExecutorError::manager(format!("missing subjob archive {}: {e}", archive_path.display())))?;

    Ok(SubjobResultDto {
        worker_id: state.worker_id,
        subjob_id,
        atom_exit_codes,
        atom_timings,
        archive_base64: BASE64.encode(archive_bytes),
    })
}

async fn run_shell_in_dir(command: &str, dir: &Path) -> Result<()> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(dir)
        .output()
        .await
        .map_err(|e| ExecutorError::manager(format!("failed to spawn '{command}': {e}")))?;

    if !output.status.success() {
        return Err(ExecutorError::manager(format!(
            "'{command}' exited with status {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_shell_in_dir_runs_in_the_given_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker"), "hi").unwrap();
        run_shell_in_dir("test -f marker", dir.path()).await.unwrap();
    }

    #[tokio::test]
    async fn run_shell_in_dir_surfaces_a_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_shell_in_dir("exit 7", dir.path()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Manager(_)));
    }

    #[tokio::test]
    async fn collect_subjob_result_reads_back_exit_codes_and_timings() {
        let root = tempfile::tempdir().unwrap();
        let subjob_dir = root.path().join("0");
        let atom_dir = subjob_dir.join(format!("{ATOM_DIR_FORMAT}_0_0"));
        std::fs::create_dir_all(&atom_dir).unwrap();
        std::fs::write(atom_dir.join(EXIT_CODE_FILE), "0").unwrap();
        std::fs::write(atom_dir.join(TIMING_FILE), "1.50\n").unwrap();
        std::fs::write(subjob_dir.join("results_0.tar.gz"), [0u8; 4]).unwrap();

        let config = crate::config::ExecutorConfig {
            host: std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            port: 0,
            worker_url: None,
            manager_url: "http://127.0.0.1:0".to_string(),
            hmac_secret: "secret".to_string(),
            num_executors: 1,
            artifact_dir: root.path().to_path_buf(),
            heartbeat_interval_secs: 10,
            manager_rpc_timeout_secs: 30,
        };
        let manager = crate::client::ManagerClient::new("http://127.0.0.1:0", "secret", std::time::Duration::from_secs(1));
        let state = AppState::new(config, manager, 3, "session-a".to_string());

        let result = collect_subjob_result(&state, 0, 0, 1).await.unwrap();
        assert_eq!(result.worker_id, 3);
        assert_eq!(result.atom_exit_codes, vec![0]);
        assert_eq!(result.atom_timings, vec![1.5]);
    }
}

//! JSON request/response DTOs for the manager<->worker wire protocol.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

/// `POST /build` — request a new build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequestDto {
    pub project_type: String,
    pub project_params: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequestResponseDto {
    pub build_id: u32,
}

/// `GET /build/{id}` — build status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildStatusDto {
    pub build_id: u32,
    pub state: String,
    pub error_message: Option<String>,
}

/// `POST /worker` — a worker registers itself with the manager. The
/// manager, not the worker, is the authority on worker ids: it allocates
/// one fresh per registration and returns it in [`ConnectWorkerResponseDto`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectWorkerDto {
    pub worker_url: String,
    pub num_executors: u32,
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectWorkerResponseDto {
    pub worker_id: u32,
}

/// `POST /worker/{id}/state` — a worker reports a state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStateUpdateDto {
    pub state: WorkerStateDto,
    pub build_id: Option<u32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStateDto {
    Idle,
    Disconnected,
    Shutdown,
    SetupCompleted,
    SetupFailed,
}

/// `POST /worker/{worker_url}/build/{build_id}/setup` — manager asks a
/// worker to set up a build. `project_directory` stands in for the
/// richer `project_type_params` blob of the original protocol (this
/// binary only ships the `directory` project type); `executor_start_index`
/// is this worker's pre-allocation `num_executors_allocated`, the base
/// every local executor index is offset by to produce a build-wide unique
/// `BUILD_EXECUTOR_INDEX`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupBuildDto {
    pub build_id: u32,
    pub project_directory: String,
    pub setup_build: Option<String>,
    pub executor_start_index: u32,
}

/// `POST /worker/{worker_url}/build/{build_id}/teardown` — manager tears
/// a build down on a worker once it holds no more of that worker's
/// executors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeardownBuildDto {
    pub build_id: u32,
    pub teardown_build: Option<String>,
}

/// `POST /worker/{worker_url}/build/{build_id}/subjob/{subjob_id}` —
/// manager assigns a subjob to a worker executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSubjobDto {
    pub build_id: u32,
    pub subjob_id: u32,
    pub atomic_commands: Vec<String>,
    pub base_executor_index: u32,
}

/// `POST /build/{build_id}/subjob/{subjob_id}/result` — worker reports a
/// finished subjob back to the manager.
///
/// `archive_base64` carries the `results_{subjob_id}.tar.gz` archive
/// produced by [`clusterrunner_core::executor::SubjobExecutor`], base64
/// encoded so the whole result fits in one signed JSON body rather than a
/// separate multipart upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjobResultDto {
    pub worker_id: u32,
    pub subjob_id: u32,
    pub atom_exit_codes: Vec<i32>,
    pub atom_timings: Vec<f64>,
    pub archive_base64: String,
}

/// `GET /worker/{worker_url}/is_alive` — liveness probe response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsAliveDto {
    pub session_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_state_dto_serializes_snake_case() {
        let json = serde_json::to_string(&WorkerStateDto::SetupFailed).unwrap();
        assert_eq!(json, "\"setup_failed\"");
    }

    #[test]
    fn start_subjob_dto_round_trips() {
        let dto = StartSubjobDto {
            build_id: 1,
            subjob_id: 0,
            atomic_commands: vec!["echo hi".to_string()],
            base_executor_index: 2,
        };
        let json = serde_json::to_string(&dto).unwrap();
        let back: StartSubjobDto = serde_json::from_str(&json).unwrap();
        assert_eq!(back.atomic_commands, dto.atomic_commands);
    }
}

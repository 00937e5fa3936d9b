//! `DirectoryProjectType`: the manager's one built-in [`ProjectType`] —
//! a project checkout that already exists on the manager's local disk.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clusterrunner_core::atom::Atom;
use clusterrunner_core::error::{Error, Result};
use clusterrunner_core::job_config::JobConfig;
use clusterrunner_core::project_type::{CommandOutput, ProjectType};
use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::Mutex;

const TRACING_TARGET: &str = "clusterrunner_manager::project_type";

/// Filename of a project's job configuration, read relative to its
/// `project_directory`.
pub const CONFIG_FILENAME: &str = "clusterrunner.yaml";

/// `project_params` shape for the directory project type, as posted in a
/// `POST /build` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryProjectParams {
    /// Absolute path to the directory containing the project and its job
    /// config file.
    pub project_directory: String,

    /// An inline job config document, used in place of the on-disk
    /// `clusterrunner.yaml` when present.
    #[serde(default)]
    pub config: Option<serde_json::Value>,

    /// Name given to the parsed [`JobConfig`].
    #[serde(default = "default_job_name")]
    pub job_name: String,
}

fn default_job_name() -> String {
    "build".to_string()
}

/// A project checkout that already exists on the manager's local
/// filesystem: no fetch step, job config read either inline from the
/// build request or from a `clusterrunner.yaml` file in the directory.
///
/// The on-disk config file is parsed as JSON rather than YAML: JSON is a
/// valid subset of a simple flow-style YAML document, and full
/// indentation-based YAML parsing is out of scope (see
/// [`JobConfig::construct_from_value`]).
pub struct DirectoryProjectType {
    project_directory: PathBuf,
    inline_config: Option<serde_json::Value>,
    job_name: String,
    timings_root: PathBuf,
    kill_requested: Arc<AtomicBool>,
    running_pids: Mutex<Vec<u32>>,
}

impl DirectoryProjectType {
    pub fn new(
        project_directory: impl Into<PathBuf>,
        inline_config: Option<serde_json::Value>,
        job_name: impl Into<String>,
        timings_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            project_directory: project_directory.into(),
            inline_config,
            job_name: job_name.into(),
            timings_root: timings_root.into(),
            kill_requested: Arc::new(AtomicBool::new(false)),
            running_pids: Mutex::new(Vec::new()),
        }
    }

    pub fn from_params(params: DirectoryProjectParams, timings_root: impl Into<PathBuf>) -> Self {
        Self::new(
            params.project_directory,
            params.config,
            params.job_name,
            timings_root,
        )
    }

    fn config_file_path(&self) -> PathBuf {
        self.project_directory.join(CONFIG_FILENAME)
    }
}

impl ProjectType for DirectoryProjectType {
    type Params = DirectoryProjectParams;

    async fn fetch_project(&self) -> Result<()> {
        if !tokio::fs::try_exists(&self.project_directory)
            .await
            .unwrap_or(false)
        {
            return Err(Error::setup_failure(format!(
                "directory {} does not exist",
                self.project_directory.display()
            )));
        }
        Ok(())
    }

    async fn job_config(&self) -> Result<Option<JobConfig>> {
        if let Some(inline) = &self.inline_config {
            return JobConfig::construct_from_value(&self.job_name, inline.clone()).map(Some);
        }

        let config_path = self.config_file_path();
        let contents = match tokio::fs::read_to_string(&config_path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(Error::from(err)),
        };

        let value: serde_json::Value = serde_json::from_str(&contents).map_err(|e| {
            Error::validation(format!(
                "malformed job config at {}: {e}",
                config_path.display()
            ))
        })?;
        JobConfig::construct_from_value(&self.job_name, value).map(Some)
    }

    async fn execute_command_in_project(&self, command: &str) -> Result<CommandOutput> {
        if self.kill_requested.load(Ordering::SeqCst) {
            return Err(Error::internal(
                "execution aborted: kill_subprocesses was called",
            ));
        }

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.project_directory)
            .env("PROJECT_DIR", &self.project_directory)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(Error::from)?;
        if let Some(pid) = child.id() {
            self.running_pids.lock().await.push(pid);
        }

        let output = child.wait_with_output().await.map_err(Error::from)?;

        if let Some(pid) = child.id() {
            self.running_pids.lock().await.retain(|p| *p != pid);
        }

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn timing_file_path(&self, job_name: &str) -> PathBuf {
        let mut relative = PathBuf::new();
        for component in self.project_directory.components() {
            if let std::path::Component::Normal(part) = component {
                relative.push(part);
            }
        }
        self.timings_root
            .join(relative)
            .join(format!("{job_name}.timing.json"))
    }

    fn atoms_override(&self) -> Option<Vec<Atom>> {
        None
    }

    fn project_directory(&self) -> PathBuf {
        self.project_directory.clone()
    }

    fn project_id(&self) -> String {
        self.project_directory.to_string_lossy().into_owned()
    }

    async fn kill_subprocesses(&self) {
        self.kill_requested.store(true, Ordering::SeqCst);
        let pids = self.running_pids.lock().await.clone();
        for pid in pids {
            tracing::info!(target: TRACING_TARGET, pid, "Killing subprocess");
            let _ = Command::new("kill")
                .arg("-TERM")
                .arg(pid.to_string())
                .kill_on_drop(false)
                .spawn();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetch_project_rejects_a_missing_directory() {
        let project = DirectoryProjectType::new("/no/such/directory", None, "build", "/tmp/timings");
        assert!(project.fetch_project().await.is_err());
    }

    #[tokio::test]
    async fn fetch_project_accepts_an_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let project = DirectoryProjectType::new(dir.path(), None, "build", "/tmp/timings");
        project.fetch_project().await.unwrap();
    }

    #[tokio::test]
    async fn job_config_prefers_inline_config_over_the_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILENAME),
            r#"{"commands": ["from file"]}"#,
        )
        .unwrap();

        let inline = serde_json::json!({"commands": ["from inline"]});
        let project = DirectoryProjectType::new(dir.path(), Some(inline), "build", "/tmp/timings");

        let config = project.job_config().await.unwrap().unwrap();
        assert_eq!(config.command, "from inline");
    }

    #[tokio::test]
    async fn job_config_falls_back_to_the_on_disk_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILENAME),
            r#"{"commands": ["make test"]}"#,
        )
        .unwrap();

        let project = DirectoryProjectType::new(dir.path(), None, "build", "/tmp/timings");
        let config = project.job_config().await.unwrap().unwrap();
        assert_eq!(config.command, "make test");
    }

    #[tokio::test]
    async fn job_config_is_none_when_no_file_and_no_inline_config() {
        let dir = tempfile::tempdir().unwrap();
        let project = DirectoryProjectType::new(dir.path(), None, "build", "/tmp/timings");
        assert!(project.job_config().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn execute_command_in_project_captures_output_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let project = DirectoryProjectType::new(dir.path(), None, "build", "/tmp/timings");
        let output = project
            .execute_command_in_project("echo hi; exit 3")
            .await
            .unwrap();
        assert_eq!(output.exit_code, 3);
        assert!(output.stdout.contains("hi"));
    }

    #[test]
    fn project_id_is_the_directory_path() {
        let project = DirectoryProjectType::new("/a/b/c", None, "build", "/tmp/timings");
        assert_eq!(project.project_id(), "/a/b/c");
    }
}

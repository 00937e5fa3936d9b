//! Worker-side subjob executor: runs each atom's shell invocation,
//! captures its artifacts, and archives the result.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::subjob::{COMMAND_FILE, EXIT_CODE_FILE, OUTPUT_FILE, TIMING_FILE};

const TRACING_TARGET: &str = "clusterrunner_core::executor";

/// One local execution slot on a worker process.
pub struct SubjobExecutor {
    /// This executor's index among the worker's local executor slots.
    pub id: u32,
    pub artifacts_root: PathBuf,
}

impl SubjobExecutor {
    pub fn new(id: u32, artifacts_root: PathBuf) -> Self {
        Self { id, artifacts_root }
    }

    /// Runs every atomic command for a subjob, one at a time, recording
    /// per-atom artifacts, then archives the subjob's artifact
    /// directories into `results_{subjob_id}.tar.gz`. `cancel` is checked
    /// between atoms and races the currently running atom's subprocess;
    /// a firing cancellation kills the active atom and stops the subjob.
    pub async fn execute_subjob(
        &self,
        build_id: u32,
        subjob_id: u32,
        atomic_commands: &[String],
        base_executor_index: u32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let subjob_artifact_dir = self.artifacts_root.join(build_id.to_string());

        for (atom_id, command) in atomic_commands.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(Error::canceled(format!("subjob {subjob_id} killed before atom {atom_id} started")));
            }

            let atom_id = atom_id as u32;
            let atom_dir = subjob_artifact_dir.join(format!("artifact_{subjob_id}_{atom_id}"));
            reset_dir(&atom_dir)?;

            self.execute_atom_command(&atom_dir, command, atom_id, base_executor_index, cancel)
                .await?;
        }

        self.archive_subjob(&subjob_artifact_dir, subjob_id).await
    }

    async fn execute_atom_command(
        &self,
        atom_dir: &Path,
        command: &str,
        atom_id: u32,
        base_executor_index: u32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        std::fs::write(atom_dir.join(COMMAND_FILE), command).map_err(Error::from)?;

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .env("ARTIFACT_DIR", atom_dir)
            .env("ATOM_ID", atom_id.to_string())
            .env("MACHINE_EXECUTOR_INDEX", self.id.to_string())
            .env(
                "BUILD_EXECUTOR_INDEX",
                (base_executor_index + self.id).to_string(),
            )
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started_at = Instant::now();
        let mut child = cmd.spawn().map_err(Error::from)?;
        let mut stdout = child.stdout.take().expect("stdout piped above");
        let mut stderr = child.stderr.take().expect("stderr piped above");
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stdout.read_to_end(&mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            buf
        });

        let exit_code = tokio::select! {
            biased;

            () = cancel.cancelled() => {
                tracing::warn!(target: TRACING_TARGET, atom_id, "Killing atom, subjob was killed");
                let _ = child.kill().await;
                -1
            }
            status = child.wait() => status.map_err(Error::from)?.code().unwrap_or(-1),
        };
        let elapsed = started_at.elapsed().as_secs_f64();

        let mut output = stdout_task.await.unwrap_or_default();
        output.extend(stderr_task.await.unwrap_or_default());
        std::fs::write(atom_dir.join(OUTPUT_FILE), output).map_err(Error::from)?;
        std::fs::write(atom_dir.join(EXIT_CODE_FILE), exit_code.to_string()).map_err(Error::from)?;
        std::fs::write(atom_dir.join(TIMING_FILE), format!("{elapsed:.2}\n")).map_err(Error::from)?;

        tracing::debug!(
            target: TRACING_TARGET,
            atom_id,
            exit_code,
            elapsed_secs = elapsed,
            "Atom command finished"
        );

        if cancel.is_cancelled() {
            return Err(Error::canceled(format!("atom {atom_id} killed mid-execution")));
        }
        Ok(())
    }

    async fn archive_subjob(&self, subjob_artifact_dir: &Path, subjob_id: u32) -> Result<()> {
        let archive_path = subjob_artifact_dir.join(format!("results_{subjob_id}.tar.gz"));
        let dir = subjob_artifact_dir.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let file = std::fs::File::create(&archive_path).map_err(Error::from)?;
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);
            if dir.exists() {
                builder.append_dir_all(".", &dir).map_err(Error::from)?;
            }
            builder
                .into_inner()
                .map_err(Error::from)?
                .finish()
                .map_err(Error::from)?;
            Ok(())
        })
        .await
        .map_err(|e| Error::internal("archive task panicked").with_source(Box::new(e)))??;
        Ok(())
    }
}

fn reset_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir).map_err(Error::from)?;
    }
    std::fs::create_dir_all(dir).map_err(Error::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn execute_subjob_records_artifacts_per_atom() {
        let root = tempfile::tempdir().unwrap();
        let executor = SubjobExecutor::new(0, root.path().to_path_buf());
        let commands = vec!["echo hello".to_string(), "exit 3".to_string()];
        let cancel = CancellationToken::new();

        executor.execute_subjob(1, 0, &commands, 0, &cancel).await.unwrap();

        let subjob_dir = root.path().join("1");
        let atom0 = subjob_dir.join("artifact_0_0");
        let atom1 = subjob_dir.join("artifact_0_1");

        assert_eq!(
            std::fs::read_to_string(atom0.join(EXIT_CODE_FILE)).unwrap(),
            "0"
        );
        assert_eq!(
            std::fs::read_to_string(atom1.join(EXIT_CODE_FILE)).unwrap(),
            "3"
        );
        assert!(
            std::fs::read_to_string(atom0.join(OUTPUT_FILE))
                .unwrap()
                .contains("hello")
        );
        assert!(subjob_dir.join("results_0.tar.gz").exists());
    }

    #[tokio::test]
    async fn execute_subjob_stops_when_canceled_before_it_starts() {
        let root = tempfile::tempdir().unwrap();
        let executor = SubjobExecutor::new(0, root.path().to_path_buf());
        let commands = vec!["sleep 5".to_string()];
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = executor.execute_subjob(1, 0, &commands, 0, &cancel).await;

        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind, crate::error::ErrorKind::Canceled);
    }
}

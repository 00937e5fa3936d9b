//! `ProjectType`: the pluggable collaborator that knows how to fetch a
//! project checkout and execute commands inside it.
//!
//! Concrete implementations (git/docker/directory-based checkouts, real
//! process execution) are outside this crate's scope; this module defines
//! the contract and an in-memory test double used throughout the core
//! crate's own test suite.

use std::path::PathBuf;

use crate::atom::Atom;
use crate::error::Result;
use crate::job_config::JobConfig;

/// The result of running a command inside a project checkout.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// A pluggable source of a project checkout and a way to run commands
/// inside it.
///
/// Implementations own the associated credential/parameter shapes needed
/// to fetch their particular kind of project (a git ref, a docker image, a
/// local directory, ...).
#[allow(async_fn_in_trait)]
pub trait ProjectType: Send + Sync {
    /// Parameters needed to identify which project to fetch.
    type Params: Send + Sync;

    /// Fetches (or refreshes) the project checkout this instance refers
    /// to.
    async fn fetch_project(&self) -> Result<()>;

    /// Parses and returns this project's job configuration, if present.
    async fn job_config(&self) -> Result<Option<JobConfig>>;

    /// Runs `command` inside the project checkout and captures its
    /// output.
    async fn execute_command_in_project(&self, command: &str) -> Result<CommandOutput>;

    /// Path to this job's timing data file, if the project has run before.
    fn timing_file_path(&self, job_name: &str) -> PathBuf;

    /// If set, bypasses atomization entirely: every string becomes a bare
    /// atom with no exported variable.
    fn atoms_override(&self) -> Option<Vec<Atom>> {
        None
    }

    /// The project's local checkout directory, used to relativize atom
    /// command strings before they're used as timing-data keys.
    fn project_directory(&self) -> PathBuf;

    /// Opaque key identifying which project this is, used by
    /// [`crate::request_handler::ProjectPreparationLocks`] to serialize
    /// preparation of builds that share a checkout (e.g. a repo path).
    fn project_id(&self) -> String;

    /// Extra key/value pairs merged into the project-type parameters sent
    /// to a worker's setup RPC (e.g. rewriting a git remote to point back
    /// at the manager). Empty by default.
    fn worker_param_overrides(&self) -> serde_json::Map<String, serde_json::Value> {
        serde_json::Map::new()
    }

    /// Best-effort termination of any subprocesses this project type has
    /// spawned.
    async fn kill_subprocesses(&self);
}

/// An in-memory [`ProjectType`] test double used by this crate's own unit
/// tests (and suitable for higher-level integration tests in the binary
/// crates).
#[cfg(any(test, feature = "test-util"))]
pub mod test_double {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct FakeProjectType {
        outputs: Mutex<HashMap<String, CommandOutput>>,
        job_config: Mutex<Option<JobConfig>>,
        directory: PathBuf,
    }

    impl FakeProjectType {
        pub fn new() -> Self {
            Self {
                outputs: Mutex::new(HashMap::new()),
                job_config: Mutex::new(None),
                directory: PathBuf::from("/fake/project"),
            }
        }

        pub fn with_command_output(
            self,
            command: &str,
            exit_code: i32,
            stdout: &str,
        ) -> Self {
            self.outputs.lock().unwrap().insert(
                command.to_string(),
                CommandOutput {
                    exit_code,
                    stdout: stdout.to_string(),
                    stderr: String::new(),
                },
            );
            self
        }

        pub fn with_job_config(self, job_config: JobConfig) -> Self {
            *self.job_config.lock().unwrap() = Some(job_config);
            self
        }
    }

    impl ProjectType for FakeProjectType {
        type Params = ();

        async fn fetch_project(&self) -> Result<()> {
            Ok(())
        }

        async fn job_config(&self) -> Result<Option<JobConfig>> {
            Ok(self.job_config.lock().unwrap().clone())
        }

        async fn execute_command_in_project(&self, command: &str) -> Result<CommandOutput> {
            Ok(self
                .outputs
                .lock()
                .unwrap()
                .get(command)
                .cloned()
                .unwrap_or(CommandOutput {
                    exit_code: 0,
                    stdout: String::new(),
                    stderr: String::new(),
                }))
        }

        fn timing_file_path(&self, job_name: &str) -> PathBuf {
            self.directory.join(format!("{job_name}.timing.json"))
        }

        fn project_directory(&self) -> PathBuf {
            self.directory.clone()
        }

        fn project_id(&self) -> String {
            self.directory.to_string_lossy().to_string()
        }

        async fn kill_subprocesses(&self) {}
    }
}

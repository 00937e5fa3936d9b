//! BuildRequestHandler: turns a queued build into a prepared one
//! (atomization + grouping), serialized per project id.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::atomizer::atomize_in_project;
use crate::build::{Build, build_artifact_directory};
use crate::error::Result;
use crate::grouper::{time_based_groupings, trivial_groupings};
use crate::job_config::JobConfig;
use crate::project_type::ProjectType;
use crate::subjob::{Subjob, atom_key};

const TRACING_TARGET: &str = "clusterrunner_core::request_handler";

/// Prepares `build` against `project_type`: fetches the project, parses its
/// job config, computes subjobs, and transitions the build to `Prepared`
/// (or `Error` on any failure along the way). `artifacts_root` is the
/// process-wide artifact directory; this build's own artifacts land under
/// `artifacts_root/build.id`.
///
/// Callers are responsible for serializing calls that share a project id
/// via [`ProjectPreparationLocks`] keyed on `project_type.project_id()`
/// — different projects may prepare concurrently, but two builds of the
/// same project must not race on the same checkout.
pub async fn prepare_build<P: ProjectType>(
    build: &mut Build,
    project_type: &P,
    artifacts_root: &Path,
) -> Result<()> {
    build.start_preparing()?;

    if let Err(err) = try_prepare(build, project_type, artifacts_root).await {
        build.mark_failed(err.to_string());
        return Err(err);
    }

    Ok(())
}

async fn try_prepare<P: ProjectType>(
    build: &mut Build,
    project_type: &P,
    artifacts_root: &Path,
) -> Result<()> {
    project_type.fetch_project().await?;

    let job_config = project_type.job_config().await?.ok_or_else(|| {
        crate::error::Error::setup_failure(
            "Build failed while trying to parse clusterrunner.yaml.",
        )
    })?;

    let subjobs = compute_subjobs_for_build(build.id, project_type, &job_config).await?;
    let artifact_dir = build_artifact_directory(artifacts_root, build.id);
    let timing_file_path = Some(project_type.timing_file_path(&job_config.name));
    build.prepare(subjobs, job_config, artifact_dir, timing_file_path)?;
    Ok(())
}

async fn compute_subjobs_for_build<P: ProjectType>(
    build_id: u32,
    project_type: &P,
    job_config: &JobConfig,
) -> Result<Vec<Subjob>> {
    let atoms = match project_type.atoms_override() {
        Some(atoms) => atoms,
        None => atomize_in_project(project_type, &job_config.atomizer).await?,
    };

    let timing_file_path = project_type.timing_file_path(&job_config.name);
    let known_times = read_timing_map(&timing_file_path);

    let project_directory = project_type.project_directory();
    let groups = if known_times.is_empty() {
        trivial_groupings(atoms)
    } else {
        time_based_groupings(
            atoms,
            &known_times,
            |atom| atom_key(&atom.command_string, &project_directory),
            job_config.max_executors,
        )
    };

    Ok(groups
        .into_iter()
        .enumerate()
        .map(|(idx, atoms)| Subjob::new(build_id, idx as u32, atoms))
        .collect())
}

fn read_timing_map(path: &std::path::Path) -> HashMap<String, f64> {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return HashMap::new();
    };
    match serde_json::from_str(&contents) {
        Ok(map) => map,
        Err(err) => {
            tracing::warn!(
                target: TRACING_TARGET,
                path = %path.display(),
                error = %err,
                "Failed to parse timing file, proceeding without timing data"
            );
            HashMap::new()
        }
    }
}

/// Per-project-id mutexes serializing build preparation against the same
/// project while allowing different projects to prepare concurrently.
#[derive(Default)]
pub struct ProjectPreparationLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ProjectPreparationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock_for(&self, project_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project_type::test_double::FakeProjectType;
    use jiff::Timestamp;

    fn job_config_doc() -> crate::job_config::RawJobConfig {
        crate::job_config::RawJobConfig {
            setup_build: None,
            teardown_build: None,
            commands: vec!["make test".to_string()],
            atomizers: vec![crate::job_config::AtomizerEntry::Enumerate {
                var_name: "TEST_NAME".to_string(),
                command: "ls *.py".to_string(),
            }],
            max_executors: Some(4),
            max_executors_per_slave: Some(4),
        }
    }

    #[tokio::test]
    async fn prepare_build_transitions_to_prepared_on_success() {
        let job_config = JobConfig::construct_from_raw("job", job_config_doc()).unwrap();
        let project = FakeProjectType::new()
            .with_command_output("ls *.py", 0, "a.py\nb.py\n")
            .with_job_config(job_config);

        let artifacts_root = tempfile::tempdir().unwrap();
        let mut build = Build::new(1, Timestamp::UNIX_EPOCH);
        prepare_build(&mut build, &project, artifacts_root.path())
            .await
            .unwrap();

        assert_eq!(build.state, crate::build::BuildState::Prepared);
        assert_eq!(build.subjobs.len(), 2);
    }

    #[tokio::test]
    async fn prepare_build_fails_when_job_config_missing() {
        let project = FakeProjectType::new();
        let artifacts_root = tempfile::tempdir().unwrap();
        let mut build = Build::new(1, Timestamp::UNIX_EPOCH);
        let result = prepare_build(&mut build, &project, artifacts_root.path()).await;
        assert!(result.is_err());
        assert_eq!(build.state, crate::build::BuildState::Error);
    }

    #[tokio::test]
    async fn preparation_locks_are_per_project() {
        let locks = ProjectPreparationLocks::new();
        let a1 = locks.lock_for("project-a").await;
        let a2 = locks.lock_for("project-a").await;
        let b = locks.lock_for("project-b").await;
        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));
    }
}

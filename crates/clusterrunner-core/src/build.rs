//! Build: the top-level state machine a build request moves through.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use jiff::Timestamp;

use crate::error::{Error, Result};
use crate::job_config::JobConfig;
use crate::subjob::{EXIT_CODE_FILE, Subjob};

const TRACING_TARGET: &str = "clusterrunner_core::build";

/// How many consecutive setup failures on a single build cause it to be
/// failed outright, rather than simply torn down and retried on another
/// worker.
pub const MAX_SETUP_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Queued,
    Preparing,
    Prepared,
    Building,
    Finished,
    Error,
    Canceled,
}

impl BuildState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Error | Self::Canceled)
    }
}

#[derive(Debug)]
pub struct Build {
    pub id: u32,
    pub state: BuildState,
    pub job_config: Option<JobConfig>,
    pub subjobs: Vec<Subjob>,
    pub setup_failures: u32,
    pub error_message: Option<String>,
    pub queued_at: Timestamp,
    /// Ids of subjobs whose result has been reported back by a worker.
    /// A build is ready to finalize exactly when this covers every subjob
    /// — every subjob not yet in this set is, by construction, either
    /// still queued or in flight, so tracking completion alone is
    /// sufficient to recover `unstarted == 0 && in_flight == 0`.
    pub completed_subjob_ids: HashSet<u32>,
    /// Accumulated per-atom timings (atom key -> seconds), merged from
    /// every completed subjob's reported timings.
    pub timings: HashMap<String, f64>,
    pub artifacts_tar_file: Option<PathBuf>,
    pub artifacts_zip_file: Option<PathBuf>,
    /// `<artifacts_root>/<build_id>`: where per-atom artifact directories
    /// land and where the finished archives are written. Set on
    /// `prepare`.
    pub artifact_dir: Option<PathBuf>,
    /// Path to this job's historical timing file, if its `ProjectType`
    /// has one configured. `None` disables the timing-merge step of
    /// finalization entirely.
    pub timing_file_path: Option<PathBuf>,
}

impl Build {
    pub fn new(id: u32, queued_at: Timestamp) -> Self {
        Self {
            id,
            state: BuildState::Queued,
            job_config: None,
            subjobs: Vec::new(),
            setup_failures: 0,
            error_message: None,
            queued_at,
            completed_subjob_ids: HashSet::new(),
            timings: HashMap::new(),
            artifacts_tar_file: None,
            artifacts_zip_file: None,
            artifact_dir: None,
            timing_file_path: None,
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.state == BuildState::Canceled
    }

    pub fn has_error(&self) -> bool {
        self.state == BuildState::Error
    }

    /// Transitions a queued build into `Preparing`.
    pub fn start_preparing(&mut self) -> Result<()> {
        self.transition(BuildState::Queued, BuildState::Preparing)
    }

    /// Records successfully computed subjobs and job config, transitioning
    /// the build into `Prepared`. `artifact_dir` and `timing_file_path`
    /// are recorded for later use by [`Self::finalize`].
    pub fn prepare(
        &mut self,
        subjobs: Vec<Subjob>,
        job_config: JobConfig,
        artifact_dir: PathBuf,
        timing_file_path: Option<PathBuf>,
    ) -> Result<()> {
        self.transition(BuildState::Preparing, BuildState::Prepared)?;
        self.subjobs = subjobs;
        self.job_config = Some(job_config);
        self.artifact_dir = Some(artifact_dir);
        self.timing_file_path = timing_file_path;
        Ok(())
    }

    pub fn start_building(&mut self) -> Result<()> {
        self.transition(BuildState::Prepared, BuildState::Building)
    }

    pub fn finish(&mut self) -> Result<()> {
        self.transition(BuildState::Building, BuildState::Finished)
    }

    /// Marks the build failed with `reason`. Valid from any non-terminal
    /// state: a build can fail at any point in its lifecycle (setup
    /// failure, preparation error, etc).
    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        if self.state.is_terminal() {
            return;
        }
        self.error_message = Some(reason.into());
        self.state = BuildState::Error;
        tracing::warn!(
            target: TRACING_TARGET,
            build_id = self.id,
            reason = %self.error_message.as_deref().unwrap_or_default(),
            "Build marked failed"
        );
    }

    pub fn cancel(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.state = BuildState::Canceled;
        tracing::info!(target: TRACING_TARGET, build_id = self.id, "Build canceled");
    }

    /// Records a setup failure; if this is the `MAX_SETUP_FAILURES`-th
    /// consecutive failure, cancels and fails the build outright.
    pub fn record_setup_failure(&mut self) {
        self.setup_failures += 1;
        if self.setup_failures >= MAX_SETUP_FAILURES {
            self.cancel();
            self.mark_failed(format!(
                "Setup failed on this build more than {MAX_SETUP_FAILURES} times. Failing the build."
            ));
        }
    }

    /// Records a reported subjob result: merges its per-atom timings and
    /// marks it completed. Safe to call for a canceled build — the payload
    /// is still persisted so the worker that ran it can go idle cleanly
    /// (spec invariant: a canceled build still accepts in-flight results).
    ///
    /// Returns `true` if every subjob in the build has now completed,
    /// meaning the caller should run the finalization sequence next.
    pub fn complete_subjob(
        &mut self,
        subjob_id: u32,
        new_timings: HashMap<String, f64>,
    ) -> Result<bool> {
        if !self.subjobs.iter().any(|s| s.subjob_id == subjob_id) {
            return Err(Error::not_found(format!(
                "build {} has no subjob {subjob_id}",
                self.id
            )));
        }
        self.timings.extend(new_timings);
        self.completed_subjob_ids.insert(subjob_id);
        tracing::debug!(
            target: TRACING_TARGET,
            build_id = self.id,
            subjob_id,
            completed = self.completed_subjob_ids.len(),
            total = self.subjobs.len(),
            "Subjob completed"
        );
        Ok(self.is_ready_to_finalize())
    }

    /// True once a result has been reported for every subjob in the build.
    pub fn is_ready_to_finalize(&self) -> bool {
        !self.subjobs.is_empty() && self.completed_subjob_ids.len() == self.subjobs.len()
    }

    /// Runs the finalization sequence: writes `failures.txt` (if any atom
    /// failed), merges timing data into `self.timing_file_path` (only if
    /// the build had zero failures and a timing file path is configured),
    /// compresses `self.artifact_dir` into both archive formats, and
    /// transitions the build to `Finished`. Transitions to `Error` instead
    /// if any finalization step fails (including being called before
    /// `prepare` recorded an artifact directory).
    pub fn finalize(&mut self) -> Result<()> {
        if let Err(err) = self.try_finalize() {
            self.mark_failed(err.to_string());
            return Err(err);
        }
        Ok(())
    }

    fn try_finalize(&mut self) -> Result<()> {
        let artifact_dir = self
            .artifact_dir
            .clone()
            .ok_or_else(|| Error::finalization("build has no artifact directory to finalize"))?;

        generate_failures_file(&artifact_dir).map_err(Error::from)?;

        if let Some(timing_file_path) = self.timing_file_path.clone() {
            write_timing_data(&timing_file_path, &artifact_dir, std::mem::take(&mut self.timings))?;
        }

        create_result_archives(&artifact_dir, &artifact_dir)?;

        self.artifacts_tar_file = Some(artifact_dir.join("results.tar.gz"));
        self.artifacts_zip_file = Some(artifact_dir.join("results.zip"));
        self.finish()?;
        tracing::info!(
            target: TRACING_TARGET,
            build_id = self.id,
            "Build finalized"
        );
        Ok(())
    }

    fn transition(&mut self, expected: BuildState, next: BuildState) -> Result<()> {
        if self.state != expected {
            return Err(Error::not_ready(format!(
                "build {} is in state {:?}, expected {:?}",
                self.id, self.state, expected
            )));
        }
        self.state = next;
        Ok(())
    }
}

/// Scans `build_artifact_dir` for atom artifact directories whose exit
/// code file records a nonzero status.
pub fn failed_artifact_directories(build_artifact_dir: &Path) -> std::io::Result<Vec<String>> {
    let mut failed = Vec::new();
    if !build_artifact_dir.exists() {
        return Ok(failed);
    }
    for entry in std::fs::read_dir(build_artifact_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with("artifact_") {
            continue;
        }
        let exit_code_path = entry.path().join(EXIT_CODE_FILE);
        let Ok(contents) = std::fs::read_to_string(&exit_code_path) else {
            continue;
        };
        if contents.trim().parse::<i32>().unwrap_or(0) != 0 {
            failed.push(name);
        }
    }
    Ok(failed)
}

/// Writes `failures.txt` under `build_artifact_dir`, one failed atom
/// directory name per line. A no-op if there are no failures.
pub fn generate_failures_file(build_artifact_dir: &Path) -> std::io::Result<()> {
    let failed = failed_artifact_directories(build_artifact_dir)?;
    if failed.is_empty() {
        return Ok(());
    }
    std::fs::write(build_artifact_dir.join("failures.txt"), failed.join("\n"))
}

/// Merges `new_timing_data` into the JSON timing file at `timing_file_path`
/// by key, preserving any keys already present that are absent from
/// `new_timing_data`.
///
/// If the build had any failed atoms (per
/// [`failed_artifact_directories`]) and the timing file already exists,
/// nothing is written at all — stale timing data for the atoms that did
/// run successfully is better than timing data contaminated by a
/// partial/failed build. If the file does not exist yet, it is always
/// written, even from a build with failures, so that a first run's partial
/// timing data is not lost entirely.
pub fn write_timing_data(
    timing_file_path: &Path,
    build_artifact_dir: &Path,
    new_timing_data: HashMap<String, f64>,
) -> Result<()> {
    if new_timing_data.is_empty() {
        return Ok(());
    }

    let file_exists = timing_file_path.exists();
    let has_failures = !failed_artifact_directories(build_artifact_dir)
        .map_err(Error::from)?
        .is_empty();

    if file_exists && has_failures {
        tracing::info!(
            target: TRACING_TARGET,
            path = %timing_file_path.display(),
            "Did not write/overwrite timing data during build because of atom failures"
        );
        return Ok(());
    }

    let mut merged: HashMap<String, f64> = if file_exists {
        let contents = std::fs::read_to_string(timing_file_path).map_err(Error::from)?;
        serde_json::from_str(&contents).unwrap_or_default()
    } else {
        HashMap::new()
    };
    merged.extend(new_timing_data);

    if let Some(parent) = timing_file_path.parent() {
        std::fs::create_dir_all(parent).map_err(Error::from)?;
    }
    let serialized = serde_json::to_string_pretty(&merged)
        .map_err(|e| Error::finalization("failed to serialize timing data").with_source(Box::new(e)))?;
    std::fs::write(timing_file_path, serialized).map_err(Error::from)?;
    Ok(())
}

/// Creates `results.tar.gz` and `results.zip` under `output_dir`,
/// containing every atom artifact directory under `build_artifact_dir`.
pub fn create_result_archives(build_artifact_dir: &Path, output_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(output_dir).map_err(Error::from)?;

    let tar_path = output_dir.join("results.tar.gz");
    let tar_file = std::fs::File::create(&tar_path).map_err(Error::from)?;
    let encoder = flate2::write::GzEncoder::new(tar_file, flate2::Compression::default());
    let mut tar_builder = tar::Builder::new(encoder);
    if build_artifact_dir.exists() {
        tar_builder
            .append_dir_all(".", build_artifact_dir)
            .map_err(Error::from)?;
    }
    tar_builder
        .into_inner()
        .map_err(Error::from)?
        .finish()
        .map_err(Error::from)?;

    let zip_path = output_dir.join("results.zip");
    let zip_file = std::fs::File::create(&zip_path).map_err(Error::from)?;
    let mut zip_writer = zip::ZipWriter::new(zip_file);
    let options: zip::write::FileOptions<()> = zip::write::FileOptions::default();
    if build_artifact_dir.exists() {
        add_dir_to_zip(&mut zip_writer, build_artifact_dir, build_artifact_dir, &options)?;
    }
    zip_writer
        .finish()
        .map_err(|e| Error::finalization("failed to finalize zip archive").with_source(Box::new(e)))?;

    Ok(())
}

fn add_dir_to_zip(
    writer: &mut zip::ZipWriter<std::fs::File>,
    base: &Path,
    dir: &Path,
    options: &zip::write::FileOptions<()>,
) -> Result<()> {
    for entry in std::fs::read_dir(dir).map_err(Error::from)? {
        let entry = entry.map_err(Error::from)?;
        let path = entry.path();
        let relative = path.strip_prefix(base).unwrap_or(&path);
        if path.is_dir() {
            add_dir_to_zip(writer, base, &path, options)?;
        } else {
            writer
                .start_file(relative.to_string_lossy(), *options)
                .map_err(|e| Error::finalization("failed to add file to zip").with_source(Box::new(e)))?;
            let contents = std::fs::read(&path).map_err(Error::from)?;
            std::io::Write::write_all(writer, &contents).map_err(Error::from)?;
        }
    }
    Ok(())
}

pub fn build_artifact_directory(artifacts_root: &Path, build_id: u32) -> PathBuf {
    artifacts_root.join(build_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let mut build = Build::new(1, Timestamp::UNIX_EPOCH);
        build.start_preparing().unwrap();
        build
            .prepare(Vec::new(), job_config_fixture(), PathBuf::from("/tmp/build-1"), None)
            .unwrap();
        build.start_building().unwrap();
        build.finish().unwrap();
        assert_eq!(build.state, BuildState::Finished);
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let mut build = Build::new(1, Timestamp::UNIX_EPOCH);
        assert!(build.start_building().is_err());
    }

    #[test]
    fn mark_failed_is_a_terminal_latch() {
        let mut build = Build::new(1, Timestamp::UNIX_EPOCH);
        build.mark_failed("boom");
        build.cancel();
        assert_eq!(build.state, BuildState::Error);
    }

    #[test]
    fn third_setup_failure_fails_the_build() {
        let mut build = Build::new(1, Timestamp::UNIX_EPOCH);
        build.record_setup_failure();
        build.record_setup_failure();
        assert_eq!(build.state, BuildState::Queued);
        build.record_setup_failure();
        assert_eq!(build.state, BuildState::Error);
    }

    #[test]
    fn timing_data_not_overwritten_when_file_exists_and_build_has_failures() {
        let dir = tempfile::tempdir().unwrap();
        let artifact_dir = dir.path().join("artifacts");
        std::fs::create_dir_all(artifact_dir.join("artifact_0_0")).unwrap();
        std::fs::write(artifact_dir.join("artifact_0_0").join(EXIT_CODE_FILE), "1").unwrap();

        let timing_path = dir.path().join("timing.json");
        std::fs::write(&timing_path, r#"{"a": 1.0}"#).unwrap();

        let mut new_timings = HashMap::new();
        new_timings.insert("b".to_string(), 2.0);
        write_timing_data(&timing_path, &artifact_dir, new_timings).unwrap();

        let contents = std::fs::read_to_string(&timing_path).unwrap();
        assert!(contents.contains("\"a\""));
        assert!(!contents.contains("\"b\""));
    }

    #[test]
    fn timing_data_written_unconditionally_when_file_is_new() {
        let dir = tempfile::tempdir().unwrap();
        let artifact_dir = dir.path().join("artifacts");
        std::fs::create_dir_all(artifact_dir.join("artifact_0_0")).unwrap();
        std::fs::write(artifact_dir.join("artifact_0_0").join(EXIT_CODE_FILE), "1").unwrap();

        let timing_path = dir.path().join("timing.json");
        let mut new_timings = HashMap::new();
        new_timings.insert("b".to_string(), 2.0);
        write_timing_data(&timing_path, &artifact_dir, new_timings).unwrap();

        let contents = std::fs::read_to_string(&timing_path).unwrap();
        assert!(contents.contains("\"b\""));
    }

    #[test]
    fn failures_file_only_written_when_failures_exist() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(&dir.path().join("artifact_0_0")).unwrap();
        generate_failures_file(dir.path()).unwrap();
        assert!(!dir.path().join("failures.txt").exists());

        std::fs::write(dir.path().join("artifact_0_0").join(EXIT_CODE_FILE), "1").unwrap();
        generate_failures_file(dir.path()).unwrap();
        assert!(dir.path().join("failures.txt").exists());
    }

    fn job_config_fixture() -> JobConfig {
        JobConfig {
            name: "test".to_string(),
            setup_build: None,
            teardown_build: None,
            command: "make test".to_string(),
            atomizer: Vec::new(),
            max_executors: 1,
            max_executors_per_worker: 1,
        }
    }

    fn prepared_build_with_subjobs(n: u32, artifact_dir: &Path) -> Build {
        let mut build = Build::new(1, Timestamp::UNIX_EPOCH);
        build.start_preparing().unwrap();
        let subjobs = (0..n)
            .map(|id| Subjob::new(1, id, vec![crate::atom::Atom::new("export X=\"1\";")]))
            .collect();
        build
            .prepare(subjobs, job_config_fixture(), artifact_dir.to_path_buf(), None)
            .unwrap();
        build.start_building().unwrap();
        build
    }

    #[test]
    fn complete_subjob_rejects_unknown_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut build = prepared_build_with_subjobs(2, dir.path());
        assert!(build.complete_subjob(42, HashMap::new()).is_err());
    }

    #[test]
    fn complete_subjob_reports_ready_only_once_all_complete() {
        let dir = tempfile::tempdir().unwrap();
        let mut build = prepared_build_with_subjobs(2, dir.path());
        assert!(!build.complete_subjob(0, HashMap::new()).unwrap());
        assert!(build.complete_subjob(1, HashMap::new()).unwrap());
    }

    #[test]
    fn complete_subjob_accumulates_timings_across_subjobs() {
        let dir = tempfile::tempdir().unwrap();
        let mut build = prepared_build_with_subjobs(2, dir.path());
        let mut t0 = HashMap::new();
        t0.insert("a".to_string(), 1.0);
        build.complete_subjob(0, t0).unwrap();
        let mut t1 = HashMap::new();
        t1.insert("b".to_string(), 2.0);
        build.complete_subjob(1, t1).unwrap();
        assert_eq!(build.timings.len(), 2);
    }

    #[test]
    fn finalize_transitions_to_finished_and_records_archive_paths() {
        let dir = tempfile::tempdir().unwrap();
        let mut build = prepared_build_with_subjobs(1, dir.path());
        build.complete_subjob(0, HashMap::new()).unwrap();

        build.finalize().unwrap();

        assert_eq!(build.state, BuildState::Finished);
        assert!(build.artifacts_tar_file.unwrap().exists());
        assert!(build.artifacts_zip_file.unwrap().exists());
    }

    #[test]
    fn finalize_failure_marks_build_error() {
        // A build with no recorded artifact directory (never prepared)
        // fails finalization outright; the failure is surfaced, not
        // silently dropped.
        let mut build = Build::new(1, Timestamp::UNIX_EPOCH);
        assert!(build.finalize().is_err());
        assert_eq!(build.state, BuildState::Error);
    }
}

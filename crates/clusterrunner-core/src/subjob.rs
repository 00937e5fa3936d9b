//! Subjobs: a group of atoms dispatched together to a single worker
//! executor.

use std::path::PathBuf;

use crate::atom::Atom;

/// Per-atom artifact directory name: `artifact_{subjob_id}_{atom_id}`.
pub const ATOM_DIR_FORMAT: &str = "artifact";
pub const OUTPUT_FILE: &str = "clusterrunner_console_output";
pub const EXIT_CODE_FILE: &str = "clusterrunner_exit_code";
pub const COMMAND_FILE: &str = "clusterrunner_command";
pub const TIMING_FILE: &str = "clusterrunner_time";

#[derive(Debug, Clone)]
pub struct Subjob {
    pub build_id: u32,
    pub subjob_id: u32,
    pub atoms: Vec<Atom>,
}

impl Subjob {
    pub fn new(build_id: u32, subjob_id: u32, mut atoms: Vec<Atom>) -> Self {
        for (idx, atom) in atoms.iter_mut().enumerate() {
            atom.id = idx as u32;
        }
        Self {
            build_id,
            subjob_id,
            atoms,
        }
    }

    /// Returns the directory name for one of this subjob's atoms.
    pub fn atom_artifact_dir_name(&self, atom_id: u32) -> String {
        format!("{ATOM_DIR_FORMAT}_{}_{atom_id}", self.subjob_id)
    }

    /// Builds the full shell invocation for each atom: the atom's exported
    /// variable assignment followed by the job's command, joined by a
    /// single space (not `&&` — each atom's export only needs to be visible
    /// to the one command it prefixes).
    pub fn atomic_commands(&self, job_command: &str) -> Vec<String> {
        self.atoms
            .iter()
            .map(|atom| format!("{} {job_command}", atom.command_string))
            .collect()
    }

    /// Merges newly recorded per-atom timings into `timings` by
    /// `atom_key`, overwriting only the keys present in `new_timings`.
    pub fn add_timings(
        timings: &mut std::collections::HashMap<String, f64>,
        new_timings: std::collections::HashMap<String, f64>,
    ) {
        timings.extend(new_timings);
    }

    /// Reads back per-atom actual timing values from each atom's timing
    /// file under `build_artifact_dir`, keying by the atom's command
    /// string with `project_directory` stripped as a prefix.
    pub fn read_timings(
        &mut self,
        build_artifact_dir: &std::path::Path,
        project_directory: &std::path::Path,
    ) -> std::collections::HashMap<String, f64> {
        let mut timings = std::collections::HashMap::new();
        for atom in &mut self.atoms {
            let dir = build_artifact_dir.join(self.atom_artifact_dir_name(atom.id));
            let timing_path: PathBuf = dir.join(TIMING_FILE);
            let Ok(contents) = std::fs::read_to_string(&timing_path) else {
                continue;
            };
            let Ok(actual_time) = contents.trim().parse::<f64>() else {
                continue;
            };
            atom.actual_time = Some(actual_time);
            let key = atom_key(&atom.command_string, project_directory);
            timings.insert(key, actual_time);
        }
        if timings.is_empty() {
            tracing::warn!(
                target: crate::TRACING_TARGET,
                subjob_id = self.subjob_id,
                "No atoms in subjob recorded timing data"
            );
        }
        timings
    }
}

/// Strips the project directory prefix from an atom's command string so
/// that timing data keyed from one checkout path remains valid at another.
pub fn atom_key(command_string: &str, project_directory: &std::path::Path) -> String {
    let prefix = project_directory.to_string_lossy();
    command_string.replace(prefix.as_ref(), "")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn atom(cmd: &str) -> Atom {
        Atom::new(cmd)
    }

    #[test]
    fn new_subjob_assigns_sequential_atom_ids() {
        let subjob = Subjob::new(1, 0, vec![atom("a"), atom("b"), atom("c")]);
        let ids: Vec<u32> = subjob.atoms.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn atomic_commands_joins_with_single_space() {
        let subjob = Subjob::new(1, 0, vec![atom("export FOO=\"1\";")]);
        let commands = subjob.atomic_commands("make test");
        assert_eq!(commands, vec!["export FOO=\"1\"; make test".to_string()]);
    }

    #[test]
    fn atom_key_strips_project_directory_prefix() {
        let key = atom_key(
            "export FOO=\"/home/build/repo/file.py\";",
            std::path::Path::new("/home/build/repo"),
        );
        assert_eq!(key, "export FOO=\"/file.py\";");
    }

    #[test]
    fn add_timings_overwrites_only_new_keys() {
        let mut timings = std::collections::HashMap::new();
        timings.insert("a".to_string(), 1.0);
        timings.insert("b".to_string(), 2.0);
        let mut new_timings = std::collections::HashMap::new();
        new_timings.insert("b".to_string(), 5.0);
        Subjob::add_timings(&mut timings, new_timings);
        assert_eq!(timings.get("a"), Some(&1.0));
        assert_eq!(timings.get("b"), Some(&5.0));
    }
}

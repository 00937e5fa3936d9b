//! Atoms: the smallest unit of work the atomizer produces.

use serde::{Deserialize, Serialize};

/// Lifecycle state of an atom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AtomState {
    NotStarted,
    InProgress,
    Completed,
}

/// A single unit of work: an exported environment variable assignment that,
/// combined with the owning job's command, produces one shell invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Atom {
    /// Identifier unique within the owning subjob only, assigned after
    /// grouping.
    pub id: u32,
    /// The `export VAR="value";` prefix this atom contributes to its
    /// eventual shell command.
    pub command_string: String,
    /// Expected execution time in seconds, from a prior build's timing
    /// data, if any.
    pub expected_time: Option<f64>,
    /// Actual execution time in seconds, recorded after this atom runs.
    pub actual_time: Option<f64>,
    /// Process exit code, recorded after this atom runs.
    pub exit_code: Option<i32>,
    pub state: AtomState,
}

impl Atom {
    /// Creates a new, not-yet-scheduled atom from its command string.
    pub fn new(command_string: impl Into<String>) -> Self {
        Self {
            id: 0,
            command_string: command_string.into(),
            expected_time: None,
            actual_time: None,
            exit_code: None,
            state: AtomState::NotStarted,
        }
    }

    /// Returns true if this atom's process exited with status zero.
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn mark_in_progress(&mut self) {
        self.state = AtomState::InProgress;
    }

    pub fn mark_completed(&mut self, exit_code: i32, actual_time: f64) {
        self.exit_code = Some(exit_code);
        self.actual_time = Some(actual_time);
        self.state = AtomState::Completed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_atom_starts_not_started() {
        let atom = Atom::new("export FOO=\"1\";");
        assert_eq!(atom.state, AtomState::NotStarted);
        assert!(!atom.succeeded());
    }

    #[test]
    fn mark_completed_records_results() {
        let mut atom = Atom::new("export FOO=\"1\";");
        atom.mark_completed(0, 1.23);
        assert!(atom.succeeded());
        assert_eq!(atom.actual_time, Some(1.23));
        assert_eq!(atom.state, AtomState::Completed);
    }
}

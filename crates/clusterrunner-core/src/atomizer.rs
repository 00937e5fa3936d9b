//! Atomizer: turns an atomizer spec into concrete [`Atom`]s by running
//! commands against a project checkout.

use crate::atom::Atom;
use crate::error::{Error, Result};
use crate::job_config::{AtomizerSpec, AtomizerSpecEntry};
use crate::project_type::ProjectType;

const TRACING_TARGET: &str = "clusterrunner_core::atomizer";

/// Builds the shell phrase that exports `var_name` to `value` for the
/// current platform, prefixed to the job's command for every atom that
/// enumeration produces.
#[cfg(not(windows))]
fn export_command(var_name: &str, value: &str) -> String {
    format!("export {var_name}=\"{value}\";")
}

#[cfg(windows)]
fn export_command(var_name: &str, value: &str) -> String {
    format!("set {var_name}={value}&&")
}

/// Runs each atomizer entry in `spec` against `project_type`. An
/// [`AtomizerSpecEntry::Enumerate`] entry runs its command and turns every
/// non-empty line of stdout into one exported-variable atom; an
/// [`AtomizerSpecEntry::Freeform`] entry produces exactly one atom whose
/// command string is the literal string, unwrapped.
pub async fn atomize_in_project<P: ProjectType>(
    project_type: &P,
    spec: &AtomizerSpec,
) -> Result<Vec<Atom>> {
    let mut atoms = Vec::new();
    for entry in spec {
        match entry {
            AtomizerSpecEntry::Freeform(command) => {
                atoms.push(Atom::new(command.clone()));
            }
            AtomizerSpecEntry::Enumerate { var_name, command } => {
                let output = project_type
                    .execute_command_in_project(command)
                    .await
                    .map_err(|e| {
                        Error::atomization(format!(
                            "atomizer command for '{var_name}' failed to run"
                        ))
                        .with_source(Box::new(e))
                    })?;

                if output.exit_code != 0 {
                    return Err(Error::atomization(format!(
                        "atomizer command for '{var_name}' exited with code {}",
                        output.exit_code
                    )));
                }

                let mut count = 0;
                for line in output.stdout.lines() {
                    let value = line.trim();
                    if value.is_empty() {
                        continue;
                    }
                    atoms.push(Atom::new(export_command(var_name, value)));
                    count += 1;
                }

                tracing::debug!(
                    target: TRACING_TARGET,
                    var_name = %var_name,
                    atom_count = count,
                    "Atomizer command produced atoms"
                );
            }
        }
    }

    Ok(atoms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project_type::test_double::FakeProjectType;

    #[tokio::test]
    async fn atomize_produces_one_atom_per_nonempty_line() {
        let project = FakeProjectType::new().with_command_output(
            "ls *.py",
            0,
            "a.py\nb.py\n\n   \nc.py\n",
        );
        let spec = vec![AtomizerSpecEntry::Enumerate {
            var_name: "TEST_NAME".to_string(),
            command: "ls *.py".to_string(),
        }];
        let atoms = atomize_in_project(&project, &spec).await.unwrap();
        assert_eq!(atoms.len(), 3);
        assert_eq!(atoms[0].command_string, export_command("TEST_NAME", "a.py"));
    }

    #[tokio::test]
    async fn atomize_fails_on_nonzero_exit() {
        let project = FakeProjectType::new().with_command_output("false", 1, "");
        let spec = vec![AtomizerSpecEntry::Enumerate {
            var_name: "X".to_string(),
            command: "false".to_string(),
        }];
        let err = atomize_in_project(&project, &spec).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Atomization);
    }

    #[tokio::test]
    async fn freeform_entry_produces_exactly_one_unwrapped_atom() {
        let project = FakeProjectType::new();
        let spec = vec![AtomizerSpecEntry::Freeform("./run_checks.sh".to_string())];
        let atoms = atomize_in_project(&project, &spec).await.unwrap();
        assert_eq!(atoms.len(), 1);
        assert_eq!(atoms[0].command_string, "./run_checks.sh");
    }
}

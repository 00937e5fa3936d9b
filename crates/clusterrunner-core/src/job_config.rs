//! Parsed job configuration (the Rust equivalent of `clusterrunner.yaml`).

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Executors default to effectively unbounded unless the job config caps
/// them.
pub const DEFAULT_MAX_EXECUTORS: u32 = u32::MAX;

/// One entry of an atomizer spec: either an exported-variable enumeration
/// (a command whose stdout lines each become one atom's exported value) or
/// a freeform shell string that becomes exactly one atom verbatim, with no
/// env-var wrapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtomizerSpecEntry {
    Enumerate { var_name: String, command: String },
    Freeform(String),
}

/// How an atomizer's atoms are produced: an ordered sequence of
/// [`AtomizerSpecEntry`] values.
pub type AtomizerSpec = Vec<AtomizerSpecEntry>;

/// A fully validated, joined job configuration.
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub name: String,
    pub setup_build: Option<String>,
    pub teardown_build: Option<String>,
    pub command: String,
    pub atomizer: AtomizerSpec,
    pub max_executors: u32,
    pub max_executors_per_worker: u32,
}

/// The raw, deserialized shape of a job config document before validation
/// and command-joining.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawJobConfig {
    #[serde(default)]
    pub setup_build: Option<Vec<String>>,
    #[serde(default)]
    pub teardown_build: Option<Vec<String>>,
    pub commands: Vec<String>,
    pub atomizers: Vec<AtomizerEntry>,
    #[serde(default)]
    pub max_executors: Option<u32>,
    #[serde(default)]
    pub max_executors_per_slave: Option<u32>,
}

/// One entry in a job config's `atomizers` section: either a `{var_name,
/// command}` enumeration pair or a bare freeform shell string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AtomizerEntry {
    Enumerate { var_name: String, command: String },
    Freeform(String),
}

impl JobConfig {
    /// Validates and constructs a [`JobConfig`] from an already-parsed JSON
    /// document (e.g. a `clusterrunner.yaml` file read and converted to a
    /// `serde_json::Value` by the caller). Parsing the on-disk YAML file
    /// itself is the caller's responsibility; this crate only validates and
    /// joins the already-structured document.
    pub fn construct_from_value(name: impl Into<String>, value: serde_json::Value) -> Result<Self> {
        let raw: RawJobConfig = serde_json::from_value(value)
            .map_err(|e| Error::validation(format!("malformed job config: {e}")))?;
        Self::construct_from_raw(name, raw)
    }

    /// Validates and constructs a [`JobConfig`] from a raw parsed document,
    /// joining each shell-command list into a single command string.
    pub fn construct_from_raw(name: impl Into<String>, raw: RawJobConfig) -> Result<Self> {
        if raw.commands.is_empty() {
            return Err(Error::validation(
                "job config is missing a required 'commands' section",
            ));
        }
        if raw.atomizers.is_empty() {
            return Err(Error::validation(
                "job config is missing a required 'atomizers' section",
            ));
        }

        let atomizer = raw
            .atomizers
            .into_iter()
            .map(|e| match e {
                AtomizerEntry::Enumerate { var_name, command } => {
                    AtomizerSpecEntry::Enumerate { var_name, command }
                }
                AtomizerEntry::Freeform(command) => AtomizerSpecEntry::Freeform(command),
            })
            .collect();

        Ok(Self {
            name: name.into(),
            setup_build: join_shell_commands(raw.setup_build.as_deref()),
            teardown_build: join_shell_commands(raw.teardown_build.as_deref()),
            command: join_shell_commands(Some(&raw.commands))
                .ok_or_else(|| Error::validation("'commands' produced an empty command"))?,
            atomizer,
            max_executors: raw.max_executors.unwrap_or(DEFAULT_MAX_EXECUTORS),
            max_executors_per_worker: raw
                .max_executors_per_slave
                .unwrap_or(DEFAULT_MAX_EXECUTORS),
        })
    }
}

/// Joins a list of shell commands into a single command string.
///
/// Each command is trimmed of surrounding whitespace and a trailing `;`.
/// A command ending in `&` (it backgrounds itself) is joined to the next
/// with a single space; otherwise commands are joined with `" && "`. A
/// trailing `" && "` is stripped from the final result.
fn join_shell_commands(commands: Option<&[String]>) -> Option<String> {
    let commands = commands?;
    let mut joined = String::new();
    for command in commands {
        let trimmed = command.trim().trim_end_matches(';').trim();
        if trimmed.is_empty() {
            continue;
        }
        joined.push_str(trimmed);
        if trimmed.ends_with('&') {
            joined.push(' ');
        } else {
            joined.push_str(" && ");
        }
    }
    let joined = joined.strip_suffix(" && ").unwrap_or(&joined).to_string();
    if joined.is_empty() { None } else { Some(joined) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_joins_with_double_ampersand() {
        let commands = vec!["echo one".to_string(), "echo two".to_string()];
        assert_eq!(
            join_shell_commands(Some(&commands)),
            Some("echo one && echo two".to_string())
        );
    }

    #[test]
    fn join_preserves_backgrounded_commands() {
        let commands = vec!["some_daemon &".to_string(), "echo two".to_string()];
        assert_eq!(
            join_shell_commands(Some(&commands)),
            Some("some_daemon & echo two".to_string())
        );
    }

    #[test]
    fn join_strips_trailing_semicolons_and_joiner() {
        let commands = vec!["echo one;".to_string()];
        assert_eq!(join_shell_commands(Some(&commands)), Some("echo one".to_string()));
    }

    #[test]
    fn join_of_none_is_none() {
        assert_eq!(join_shell_commands(None), None);
    }

    #[test]
    fn construct_requires_commands_and_atomizers() {
        let raw = RawJobConfig::default();
        let err = JobConfig::construct_from_raw("job", raw).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Validation);
    }

    #[test]
    fn construct_from_value_parses_json_document() {
        let value = serde_json::json!({
            "commands": ["make test"],
            "atomizers": [{"var_name": "TEST_NAME", "command": "ls *.py"}],
        });
        let config = JobConfig::construct_from_value("job", value).unwrap();
        assert_eq!(config.command, "make test");
    }

    #[test]
    fn construct_from_value_rejects_malformed_document() {
        let value = serde_json::json!({"commands": "not-an-array"});
        assert!(JobConfig::construct_from_value("job", value).is_err());
    }

    #[test]
    fn construct_from_value_parses_freeform_atomizer_entries() {
        let value = serde_json::json!({
            "commands": ["make test"],
            "atomizers": ["./run_atomizer.sh"],
        });
        let config = JobConfig::construct_from_value("job", value).unwrap();
        assert_eq!(
            config.atomizer,
            vec![AtomizerSpecEntry::Freeform("./run_atomizer.sh".to_string())]
        );
    }
}

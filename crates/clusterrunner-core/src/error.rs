//! Workspace error type shared across build orchestration.

use crate::BoxedError;

/// Result type alias for ClusterRunner core operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Main error type for the build orchestration domain.
///
/// Carries a classified [`ErrorKind`], an optional human-readable message,
/// and an optional lower-level source error for debugging.
#[derive(Debug, thiserror::Error)]
#[error("{}", .message.as_ref().map(|m| format!("{}: {}", .kind, m)).unwrap_or_else(|| .kind.to_string()))]
pub struct Error {
    /// The specific kind of error that occurred.
    pub kind: ErrorKind,
    /// Optional additional message providing more context.
    pub message: Option<String>,
    /// Optional source error for additional context.
    #[source]
    pub source: Option<BoxedError>,
}

impl Error {
    /// Creates a new error with the given kind.
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            source: None,
        }
    }

    /// Adds a message to this error.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Adds a source error to this error.
    pub fn with_source(mut self, source: BoxedError) -> Self {
        self.source = Some(source);
        self
    }

    /// Returns true if the operation that produced this error may succeed
    /// if retried (e.g. a transient worker communication failure).
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, ErrorKind::WorkerCommunication | ErrorKind::Io)
    }

    /// Returns true if this error reflects bad caller input rather than an
    /// internal failure.
    pub fn is_client_error(&self) -> bool {
        matches!(self.kind, ErrorKind::Validation | ErrorKind::NotFound)
    }
}

/// Specific kinds of errors produced by the build orchestration domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A build request, job config, or project type failed validation.
    Validation,
    /// A referenced build, worker, or artifact does not exist.
    NotFound,
    /// An operation was attempted on a build/worker that is not in a state
    /// that permits it (e.g. requesting an archive before the build finishes).
    NotReady,
    /// A manager<->worker RPC failed or a worker is dead/unreachable.
    WorkerCommunication,
    /// A worker failed to set up a build (fetch project, run `setup_build`).
    SetupFailure,
    /// Atomization (running an atomizer command) failed.
    Atomization,
    /// Build artifact finalization (timing merge, archive creation) failed.
    Finalization,
    /// Configuration was missing or malformed.
    Config,
    /// An I/O operation failed.
    Io,
    /// An internal invariant was violated.
    Internal,
    /// An in-progress operation was killed before completion.
    Canceled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation => write!(f, "validation failed"),
            Self::NotFound => write!(f, "not found"),
            Self::NotReady => write!(f, "not ready"),
            Self::WorkerCommunication => write!(f, "worker communication failed"),
            Self::SetupFailure => write!(f, "build setup failed"),
            Self::Atomization => write!(f, "atomization failed"),
            Self::Finalization => write!(f, "artifact finalization failed"),
            Self::Config => write!(f, "configuration error"),
            Self::Io => write!(f, "I/O error"),
            Self::Internal => write!(f, "internal error"),
            Self::Canceled => write!(f, "killed"),
        }
    }
}

impl Error {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation).with_message(message)
    }

    /// Creates a not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound).with_message(message)
    }

    /// Creates a not-ready error.
    pub fn not_ready(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotReady).with_message(message)
    }

    /// Creates a worker communication error.
    pub fn worker_communication(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::WorkerCommunication).with_message(message)
    }

    /// Creates a setup-failure error.
    pub fn setup_failure(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SetupFailure).with_message(message)
    }

    /// Creates an atomization error.
    pub fn atomization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Atomization).with_message(message)
    }

    /// Creates a finalization error.
    pub fn finalization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Finalization).with_message(message)
    }

    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config).with_message(message)
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal).with_message(message)
    }

    /// Creates an error for an operation killed before completion.
    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Canceled).with_message(message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::new(ErrorKind::Io).with_source(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_communication_errors_are_retryable() {
        let err = Error::worker_communication("connection refused");
        assert!(err.is_retryable());
        assert!(!err.is_client_error());
    }

    #[test]
    fn validation_errors_are_client_errors() {
        let err = Error::validation("missing commands section");
        assert!(err.is_client_error());
        assert!(!err.is_retryable());
    }

    #[test]
    fn display_includes_message() {
        let err = Error::not_found("build 42");
        assert_eq!(err.to_string(), "not found: build 42");
    }
}

//! Manager binary error type, wrapping [`clusterrunner_core::Error`] with
//! the HTTP-facing variants the axum handlers need.

use std::borrow::Cow;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Result type alias for manager operations.
pub type Result<T, E = ManagerError> = std::result::Result<T, E>;

/// Manager binary error type.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// A domain-level error from `clusterrunner-core`.
    #[error(transparent)]
    Core(#[from] clusterrunner_core::Error),

    /// The configuration supplied at startup was invalid.
    #[error("invalid configuration: {0}")]
    Config(Cow<'static, str>),

    /// An inbound request failed HMAC verification or carried a malformed
    /// signature.
    #[error("request authentication failed: {0}")]
    Auth(Cow<'static, str>),

    /// An I/O operation (results directory recycling, archive reads) failed.
    #[error("I/O error: {message}")]
    Io {
        message: Cow<'static, str>,
        #[source]
        source: std::io::Error,
    },
}

impl ManagerError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Config(message.into())
    }

    /// Creates an authentication error.
    pub fn auth(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Auth(message.into())
    }

    /// Creates an I/O error with context.
    pub fn io(message: impl Into<Cow<'static, str>>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::Core(err) => {
                if err.is_client_error() {
                    StatusCode::BAD_REQUEST
                } else if matches!(err.kind, clusterrunner_core::ErrorKind::NotReady) {
                    StatusCode::CONFLICT
                } else if err.is_retryable() {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            }
            Self::Config(_) | Self::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ManagerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        tracing::warn!(
            target: "clusterrunner_manager::error",
            error = %self,
            status = status.as_u16(),
            "Request failed"
        );
        (status, axum::Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

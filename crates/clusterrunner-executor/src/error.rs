//! Executor binary error type, wrapping [`clusterrunner_core::Error`] with
//! the HTTP-facing and manager-RPC variants the worker process needs.

use std::borrow::Cow;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Result type alias for executor operations.
pub type Result<T, E = ExecutorError> = std::result::Result<T, E>;

/// Executor binary error type.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// A domain-level error from `clusterrunner-core` (atom execution,
    /// archiving).
    #[error(transparent)]
    Core(#[from] clusterrunner_core::Error),

    /// The configuration supplied at startup was invalid.
    #[error("invalid configuration: {0}")]
    Config(Cow<'static, str>),

    /// An inbound request failed HMAC verification.
    #[error("request authentication failed: {0}")]
    Auth(Cow<'static, str>),

    /// A call out to the manager (register, heartbeat, report result)
    /// failed.
    #[error("manager communication failed: {0}")]
    Manager(Cow<'static, str>),

    /// No local execution slot was available for an assigned subjob. The
    /// manager is not expected to over-dispatch past `num_executors`, so
    /// this indicates a scheduling bug rather than ordinary backpressure.
    #[error("no execution slot available")]
    NoSlotAvailable,
}

impl ExecutorError {
    pub fn config(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Config(message.into())
    }

    pub fn auth(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Auth(message.into())
    }

    pub fn manager(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Manager(message.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::Core(err) => {
                if err.is_client_error() {
                    StatusCode::BAD_REQUEST
                } else if err.is_retryable() {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            }
            Self::Config(_) | Self::Manager(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::NoSlotAvailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ExecutorError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        tracing::warn!(
            target: "clusterrunner_executor::error",
            error = %self,
            status = status.as_u16(),
            "Request failed"
        );
        (status, axum::Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

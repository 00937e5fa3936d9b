#![forbid(unsafe_code)]

//! Manager-side HTTP server for ClusterRunner's distributed build execution.
//!
//! Composes [`clusterrunner_core::manager::Manager`] with an axum HTTP
//! surface: build submission and status for operators, worker registration
//! and result reporting for `clusterrunner-executor` processes.

pub mod background;
pub mod config;
pub mod error;
pub mod handlers;
pub mod project_type;
pub mod server;
pub mod state;
pub mod transport;

pub use error::{ManagerError, Result};
pub use state::AppState;

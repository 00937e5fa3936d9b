#![forbid(unsafe_code)]

//! Worker-side HTTP server for ClusterRunner's distributed build execution.
//!
//! Composes [`clusterrunner_core::executor::SubjobExecutor`] with an axum
//! HTTP surface the manager drives a build's lifecycle through: setup,
//! subjob assignment, teardown, liveness, and kill.

pub mod background;
pub mod client;
pub mod config;
pub mod error;
pub mod handlers;
pub mod server;
pub mod state;

pub use error::{ExecutorError, Result};
pub use state::AppState;

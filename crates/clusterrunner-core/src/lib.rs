#![doc = "Domain model and orchestration logic for distributed build execution."]

/// Boxed error type used for the `source` field of this crate's [`error::Error`].
pub type BoxedError = Box<dyn std::error::Error + Send + Sync>;

/// Tracing target used by modules in this crate that don't declare their
/// own more specific constant.
pub const TRACING_TARGET: &str = "clusterrunner_core";

pub mod allocator;
pub mod atom;
pub mod atomizer;
pub mod build;
pub mod error;
pub mod executor;
pub mod grouper;
pub mod job_config;
pub mod manager;
pub mod project_type;
pub mod request_handler;
pub mod scheduler;
pub mod subjob;
pub mod worker;

pub use error::{Error, ErrorKind, Result};

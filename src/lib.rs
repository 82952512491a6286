//! Radio Runner - task execution supervisor for remote radio lab devices
//!
//! Pulls work from the lab scheduler, compiles and runs each task in a
//! sandboxed working directory under its deadlines, and reports the outcome
//! back exactly once.

pub mod config;
pub mod core;
pub mod error;
pub mod scheduler;
pub mod shutdown;

// Re-exports
pub use config::{DeviceRole, Profile, RunnerConfig};
pub use core::{FileKind, Outcome, Pipeline, Supervisor, TaskAssignment, TaskStatus, TaskToken};
pub use error::{ProcessError, SchedulerError};
pub use scheduler::{HttpSchedulerClient, NoSchedulerClient, SchedulerClient, UploaderClient};

/// Result type alias
pub type Result<T> = anyhow::Result<T>;

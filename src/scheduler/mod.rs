//! Scheduler client - the narrow interface to the lab scheduler
//!
//! - [`HttpSchedulerClient`]: talks to the scheduler service over HTTP
//! - [`NoSchedulerClient`]: does nothing, for single manual runs
//! - [`UploaderClient`]: clears stale artifacts on the upload service

mod http;
mod noop;
mod uploader;

pub use http::HttpSchedulerClient;
pub use noop::NoSchedulerClient;
pub use uploader::UploaderClient;

use crate::core::{TaskAssignment, TaskStatus};
use crate::error::SchedulerError;
use async_trait::async_trait;

/// Header carrying the device id
pub const DEVICE_HEADER: &str = "relia-device";
/// Header carrying the device secret
pub const SECRET_HEADER: &str = "relia-password";

#[async_trait]
pub trait SchedulerClient: Send + Sync {
    /// Next unit of work for this device, `None` when nothing is pending
    async fn get_assignment(&self) -> Result<Option<TaskAssignment>, SchedulerError>;

    /// Current remote status of a task
    async fn poll_status(&self, task_id: &str) -> Result<TaskStatus, SchedulerError>;

    /// Close the task. Idempotent.
    async fn report_completion(&self, task_id: &str) -> Result<(), SchedulerError>;

    /// Attach a diagnostic to the task; callers still report completion
    async fn report_error(&self, task_id: &str, message: &str) -> Result<(), SchedulerError>;
}

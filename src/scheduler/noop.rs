//! Scheduler client that never hands out work

use super::SchedulerClient;
use crate::core::{TaskAssignment, TaskStatus};
use crate::error::SchedulerError;
use async_trait::async_trait;

/// Used when a task is run by hand; every task stays "active" and reports
/// go nowhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSchedulerClient;

#[async_trait]
impl SchedulerClient for NoSchedulerClient {
    async fn get_assignment(&self) -> Result<Option<TaskAssignment>, SchedulerError> {
        Ok(None)
    }

    async fn poll_status(&self, _task_id: &str) -> Result<TaskStatus, SchedulerError> {
        Ok(TaskStatus::Active)
    }

    async fn report_completion(&self, task_id: &str) -> Result<(), SchedulerError> {
        log::debug!("No scheduler: completion of {} not reported", task_id);
        Ok(())
    }

    async fn report_error(&self, task_id: &str, message: &str) -> Result<(), SchedulerError> {
        log::debug!("No scheduler: error for {} not reported: {}", task_id, message);
        Ok(())
    }
}

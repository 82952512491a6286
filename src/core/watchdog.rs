//! Cancellation watchdog - notices when the scheduler ends a task remotely

use super::token::TaskToken;
use crate::scheduler::SchedulerClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Background poller bound to one task
///
/// Waits `interval` (or until the token is signalled), asks the scheduler
/// for the task's status, and signals the token on a terminal status.
#[derive(Debug)]
pub struct Watchdog {
    task_id: String,
    token: TaskToken,
    handle: JoinHandle<()>,
}

impl Watchdog {
    pub fn spawn(
        client: Arc<dyn SchedulerClient>,
        task_id: impl Into<String>,
        token: TaskToken,
        interval: Duration,
    ) -> Self {
        let task_id = task_id.into();
        log::info!("Starting watchdog for task {}", task_id);
        let handle = tokio::spawn(watch(client, task_id.clone(), token.clone(), interval));
        Self {
            task_id,
            token,
            handle,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal the token and wait for the poller to exit
    pub async fn stop(self) {
        self.token.signal();
        if let Err(e) = self.handle.await {
            log::error!("Watchdog for task {} failed: {}", self.task_id, e);
        }
        log::info!("Watchdog for task {} stopped", self.task_id);
    }
}

async fn watch(
    client: Arc<dyn SchedulerClient>,
    task_id: String,
    token: TaskToken,
    interval: Duration,
) {
    loop {
        tokio::select! {
            _ = token.signalled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        let status = tokio::select! {
            _ = token.signalled() => return,
            result = client.poll_status(&task_id) => result,
        };

        match status {
            Ok(status) => {
                log::debug!("Task {} status: {}", task_id, status);
                let terminal = status.is_terminal();
                token.record_status(status.clone());
                if terminal {
                    log::info!(
                        "Task {} is {} on the scheduler, cancelling local run",
                        task_id,
                        status
                    );
                    token.signal();
                    return;
                }
            }
            Err(e) => log::warn!("Error polling status of task {}: {}", task_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{TaskAssignment, TaskStatus};
    use crate::error::SchedulerError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Reports `active` until `deleted_after` polls, then `deleted`
    struct ScriptedStatus {
        polls: AtomicUsize,
        deleted_after: usize,
        fail: bool,
    }

    #[async_trait]
    impl SchedulerClient for ScriptedStatus {
        async fn get_assignment(&self) -> Result<Option<TaskAssignment>, SchedulerError> {
            Ok(None)
        }

        async fn poll_status(&self, _task_id: &str) -> Result<TaskStatus, SchedulerError> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                return Err(SchedulerError::Decode("garbage".into()));
            }
            if n >= self.deleted_after {
                Ok(TaskStatus::Deleted)
            } else {
                Ok(TaskStatus::Active)
            }
        }

        async fn report_completion(&self, _task_id: &str) -> Result<(), SchedulerError> {
            Ok(())
        }

        async fn report_error(&self, _task_id: &str, _message: &str) -> Result<(), SchedulerError> {
            Ok(())
        }
    }

    fn scripted(deleted_after: usize, fail: bool) -> Arc<ScriptedStatus> {
        Arc::new(ScriptedStatus {
            polls: AtomicUsize::new(0),
            deleted_after,
            fail,
        })
    }

    #[tokio::test]
    async fn test_deleted_status_signals_token() {
        let client = scripted(3, false);
        let token = TaskToken::new();
        let watchdog = Watchdog::spawn(
            client.clone(),
            "t-1",
            token.clone(),
            Duration::from_millis(20),
        );

        tokio::time::timeout(Duration::from_secs(5), token.signalled())
            .await
            .unwrap();
        assert_eq!(token.last_status(), Some(TaskStatus::Deleted));
        assert_eq!(client.polls.load(Ordering::SeqCst), 3);
        watchdog.stop().await;
    }

    #[tokio::test]
    async fn test_stop_interrupts_wait() {
        let client = scripted(usize::MAX, false);
        let token = TaskToken::new();
        let watchdog = Watchdog::spawn(client.clone(), "t-2", token.clone(), Duration::from_secs(60));

        tokio::time::timeout(Duration::from_secs(2), watchdog.stop())
            .await
            .unwrap();
        assert!(token.is_signalled());
        assert_eq!(client.polls.load(Ordering::SeqCst), 0);
        assert_eq!(token.last_status(), None);
    }

    #[tokio::test]
    async fn test_poll_errors_keep_watching() {
        let client = scripted(1, true);
        let token = TaskToken::new();
        let watchdog = Watchdog::spawn(client.clone(), "t-3", token.clone(), Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!token.is_signalled());
        assert!(!watchdog.is_finished());
        assert!(client.polls.load(Ordering::SeqCst) >= 2);
        watchdog.stop().await;
    }
}

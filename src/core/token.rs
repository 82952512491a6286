//! Per-task cancellation token shared by the pipeline and the watchdog
//!
//! Ownership:
//! - the watchdog writes the last remote status, and signals on a terminal one
//! - the supervisor signals once the pipeline has concluded
//! - the pipeline only reads

use super::assignment::TaskStatus;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct TaskToken {
    signal: CancellationToken,
    status: Arc<Mutex<Option<TaskStatus>>>,
}

impl TaskToken {
    /// Fresh, unsignalled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that is also signalled when `parent` is cancelled
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self {
            signal: parent.child_token(),
            status: Arc::default(),
        }
    }

    /// Signal the token; later calls are no-ops
    pub fn signal(&self) {
        self.signal.cancel();
    }

    pub fn is_signalled(&self) -> bool {
        self.signal.is_cancelled()
    }

    /// Resolves once the token is signalled
    pub async fn signalled(&self) {
        self.signal.cancelled().await
    }

    pub fn record_status(&self, status: TaskStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = Some(status);
    }

    /// Last status reported by the scheduler, if polled at least once
    pub fn last_status(&self) -> Option<TaskStatus> {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

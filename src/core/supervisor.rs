//! Task execution supervisor - acquire, watch, run, report, repeat

use super::assignment::TaskAssignment;
use super::pipeline::{Outcome, Pipeline};
use super::token::TaskToken;
use super::transform::ProgramTransformer;
use super::watchdog::Watchdog;
use crate::config::RunnerConfig;
use crate::scheduler::{SchedulerClient, UploaderClient};
use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Top-level control loop for one device
///
/// At most one task is in flight. Every task that reaches the pipeline is
/// reported complete exactly once, whatever its outcome.
pub struct Supervisor {
    config: Arc<RunnerConfig>,
    scheduler: Arc<dyn SchedulerClient>,
    pipeline: Pipeline,
    uploader: Option<UploaderClient>,
    watchdog: Option<Watchdog>,
}

impl Supervisor {
    pub fn new(config: Arc<RunnerConfig>, scheduler: Arc<dyn SchedulerClient>) -> Self {
        let pipeline = Pipeline::new(config.clone());
        Self {
            config,
            scheduler,
            pipeline,
            uploader: None,
            watchdog: None,
        }
    }

    pub fn with_transformer(mut self, transformer: Arc<dyn ProgramTransformer>) -> Self {
        self.pipeline = self.pipeline.with_transformer(transformer);
        self
    }

    /// Clear stale uploads of the session before each run
    pub fn with_uploader(mut self, uploader: UploaderClient) -> Self {
        self.uploader = Some(uploader);
        self
    }

    /// Loop until `shutdown` is cancelled
    pub async fn run_forever(&mut self, shutdown: CancellationToken) {
        log::info!(
            "Supervisor started for {} ({})",
            self.config.device.id,
            self.config.device.role
        );
        while !shutdown.is_cancelled() {
            self.run_once(&shutdown).await;
        }
        self.retire_watchdog().await;
        log::info!("Supervisor stopped");
    }

    /// One iteration: acquire a task and run it, or back off
    ///
    /// Returns the outcome when a task was run to a conclusion.
    pub async fn run_once(&mut self, shutdown: &CancellationToken) -> Option<Outcome> {
        self.retire_watchdog().await;

        let assignment = match self.scheduler.get_assignment().await {
            Ok(Some(assignment)) => assignment,
            Ok(None) => {
                log::debug!("No assignments");
                self.pause(shutdown, self.config.timeouts.idle_backoff()).await;
                return None;
            }
            Err(e) => {
                log::error!("Error requesting an assignment: {}", e);
                self.pause(shutdown, self.config.timeouts.error_backoff()).await;
                return None;
            }
        };

        match self.execute(assignment, shutdown).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                log::error!("Task failed unexpectedly: {:#}", e);
                self.pause(shutdown, self.config.timeouts.error_backoff()).await;
                None
            }
        }
    }

    /// Run one assignment under a fresh token and report it
    ///
    /// `Err` is an internal failure; the task has still been reported complete.
    pub async fn execute(
        &mut self,
        assignment: TaskAssignment,
        shutdown: &CancellationToken,
    ) -> Result<Outcome> {
        let acquired_at = Instant::now();
        let task_id = assignment.task_id.clone();
        log::info!(
            "Acquired task {} (session {}, {}, maxTime {:?})",
            task_id,
            assignment.session_id,
            assignment.kind,
            assignment.max_time
        );

        let token = TaskToken::child_of(shutdown);
        self.reset_uploads(&assignment.session_id).await;
        self.watchdog = Some(Watchdog::spawn(
            self.scheduler.clone(),
            task_id.clone(),
            token.clone(),
            self.config.timeouts.watchdog_interval(),
        ));

        let pipeline = self.pipeline.clone();
        let task_token = token.clone();
        let joined = tokio::spawn(async move {
            pipeline.run(&assignment, &task_token, acquired_at).await
        })
        .await;

        token.signal();
        self.retire_watchdog().await;

        let result = match joined {
            Ok(result) => result.with_context(|| format!("running task {}", task_id)),
            Err(e) => Err(anyhow!("pipeline for task {} aborted: {}", task_id, e)),
        };

        self.report(&task_id, result.as_ref().ok()).await;
        result
    }

    async fn reset_uploads(&self, session_id: &str) {
        let Some(uploader) = &self.uploader else {
            return;
        };
        if session_id.is_empty() {
            log::debug!("Task has no session, nothing to reset");
            return;
        }
        if let Err(e) = uploader.reset_session(session_id).await {
            log::warn!("Could not reset uploaded data for session {}: {}", session_id, e);
        }
    }

    /// Error report for failures, then completion. Failures are logged only.
    async fn report(&self, task_id: &str, outcome: Option<&Outcome>) {
        if let Some(message) = outcome.and_then(Outcome::error_report) {
            match self.scheduler.report_error(task_id, message).await {
                Ok(()) => log::info!("Reported error output of task {}", task_id),
                Err(e) => log::error!("Failed to report error of task {}: {}", task_id, e),
            }
        }

        match self.scheduler.report_completion(task_id).await {
            Ok(()) => log::info!("Reported completion of task {}", task_id),
            Err(e) => log::error!("Failed to report completion of task {}: {}", task_id, e),
        }
    }

    async fn retire_watchdog(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.stop().await;
        }
    }

    async fn pause(&self, shutdown: &CancellationToken, duration: Duration) {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }
}

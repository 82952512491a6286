//! HTTP scheduler client

use super::{SchedulerClient, DEVICE_HEADER, SECRET_HEADER};
use crate::config::{join_url, DeviceRole, RunnerConfig};
use crate::core::{FileKind, TaskAssignment, TaskStatus};
use crate::error::SchedulerError;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Body of the next-assignment endpoint
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssignmentResponse {
    #[serde(default)]
    success: bool,
    #[serde(default, alias = "taskId")]
    task_identifier: Option<String>,
    #[serde(default, alias = "sessionId")]
    session_identifier: Option<String>,
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    file_content: Option<String>,
    #[serde(default, rename = "filetype", alias = "fileType", alias = "fileKind")]
    filetype: Option<String>,
    #[serde(default)]
    max_time: Option<f64>,
    #[serde(default)]
    message: Option<String>,
}

impl AssignmentResponse {
    fn into_assignment(self) -> Result<Option<TaskAssignment>, SchedulerError> {
        if !self.success {
            log::info!(
                "Scheduler has no assignment: {}",
                self.message.as_deref().unwrap_or("no reason given")
            );
            return Ok(None);
        }

        let Some(task_id) = self.task_identifier.filter(|id| !id.trim().is_empty()) else {
            log::info!("No assignments");
            return Ok(None);
        };

        let max_time = match self.max_time.map(Duration::try_from_secs_f64) {
            Some(Ok(max_time)) => max_time,
            Some(Err(e)) => {
                return Err(SchedulerError::InvalidAssignment {
                    reason: format!("maxTime {:?} is not a usable duration: {}", self.max_time, e),
                    task_id,
                })
            }
            None => {
                return Err(SchedulerError::InvalidAssignment {
                    task_id,
                    reason: "maxTime is missing".to_string(),
                })
            }
        };

        let kind = FileKind::from_wire(self.filetype.as_deref().unwrap_or_default());
        let mut assignment = TaskAssignment::new(
            task_id,
            self.session_identifier.unwrap_or_default(),
            kind,
            self.file_content.unwrap_or_default(),
            max_time,
        );
        if let Some(file) = self.file {
            assignment = assignment.with_file_name(file);
        }
        Ok(Some(assignment))
    }
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorReport<'a> {
    error_message: &'a str,
    error_time: String,
}

/// Scheduler client over HTTP, authenticated by device id and secret headers
#[derive(Debug, Clone)]
pub struct HttpSchedulerClient {
    http: reqwest::Client,
    base_url: String,
    role: DeviceRole,
    server_error_backoff: Duration,
}

impl HttpSchedulerClient {
    pub fn new(config: &RunnerConfig) -> Result<Self, SchedulerError> {
        let http = authenticated_client(config)?;
        Ok(Self {
            http,
            base_url: config.scheduler_url.clone(),
            role: config.device.role,
            server_error_backoff: config.timeouts.server_error_backoff(),
        })
    }

    fn tasks_url(&self, suffix: &str) -> String {
        join_url(
            &self.base_url,
            &format!("scheduler/devices/tasks/{}", suffix),
        )
    }

    async fn fetch_assignment(&self) -> Result<Option<TaskAssignment>, SchedulerError> {
        let url = self.tasks_url(&format!("{}?max_seconds=5", self.role));
        let response = self.http.get(&url).send().await?;
        let body = checked_body(response).await?;

        let data: AssignmentResponse = serde_json::from_str(&body)
            .map_err(|e| SchedulerError::Decode(format!("{e}; body: {body}")))?;
        data.into_assignment()
    }

    /// Close a task we were handed but cannot run, so it does not stay
    /// assigned to this device
    async fn reject(&self, task_id: &str, reason: &str) {
        log::error!("Rejecting task {}: {}", task_id, reason);
        let message = format!("Task rejected by device: {}", reason);
        if let Err(e) = self.report_error(task_id, &message).await {
            log::error!("Failed to report error of task {}: {}", task_id, e);
        }
        match self.report_completion(task_id).await {
            Ok(()) => log::info!("Reported completion of rejected task {}", task_id),
            Err(e) => log::error!("Failed to report completion of task {}: {}", task_id, e),
        }
    }
}

/// Client carrying the device credentials on every request
pub(crate) fn authenticated_client(config: &RunnerConfig) -> Result<reqwest::Client, SchedulerError> {
    let mut headers = HeaderMap::new();
    let device = HeaderValue::from_str(&config.device.id)
        .map_err(|e| SchedulerError::Rejected(format!("device id is not a valid header: {e}")))?;
    let mut secret = HeaderValue::from_str(&config.device.secret)
        .map_err(|e| SchedulerError::Rejected(format!("device secret is not a valid header: {e}")))?;
    secret.set_sensitive(true);
    headers.insert(DEVICE_HEADER, device);
    headers.insert(SECRET_HEADER, secret);

    let timeout = config.timeouts.request_timeout();
    let client = reqwest::Client::builder()
        .default_headers(headers)
        .connect_timeout(timeout)
        .timeout(timeout)
        .build()?;
    Ok(client)
}

/// Response body, or a server error for non-2xx statuses
pub(crate) async fn checked_body(response: reqwest::Response) -> Result<String, SchedulerError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(SchedulerError::Server {
            status: status.as_u16(),
            body,
        });
    }
    Ok(body)
}

#[async_trait]
impl SchedulerClient for HttpSchedulerClient {
    async fn get_assignment(&self) -> Result<Option<TaskAssignment>, SchedulerError> {
        match self.fetch_assignment().await {
            Ok(assignment) => Ok(assignment),
            Err(SchedulerError::InvalidAssignment { task_id, reason }) => {
                self.reject(&task_id, &reason).await;
                Ok(None)
            }
            Err(e) => {
                log::error!("Error in get_assignment(): {}", e);
                if e.is_server_error() {
                    tokio::time::sleep(self.server_error_backoff).await;
                }
                Ok(None)
            }
        }
    }

    async fn poll_status(&self, task_id: &str) -> Result<TaskStatus, SchedulerError> {
        let url = self.tasks_url(&format!("{}/{}", self.role, task_id));
        let response = self.http.get(&url).send().await?;
        let body = checked_body(response).await?;

        let data: StatusResponse = serde_json::from_str(&body)
            .map_err(|e| SchedulerError::Decode(format!("{e}; body: {body}")))?;
        let raw = data.status.unwrap_or_default();
        let status = TaskStatus::from_wire(&raw);
        if status == TaskStatus::Unknown {
            log::warn!("Unrecognised status {:?} for task {}", raw, task_id);
        }
        Ok(status)
    }

    async fn report_completion(&self, task_id: &str) -> Result<(), SchedulerError> {
        let url = self.tasks_url(&format!("{}/{}", self.role, task_id));
        let response = self.http.post(&url).send().await?;
        checked_body(response).await?;
        Ok(())
    }

    async fn report_error(&self, task_id: &str, message: &str) -> Result<(), SchedulerError> {
        let url = self.tasks_url(&format!("error_message/{}", task_id));
        let report = ErrorReport {
            error_message: message,
            error_time: chrono::Local::now()
                .format("%Y-%m-%dT%H:%M:%S%.6f")
                .to_string(),
        };
        let response = self.http.post(&url).json(&report).send().await?;
        checked_body(response).await?;
        Ok(())
    }
}

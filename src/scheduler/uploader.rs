//! Upload service client

use super::http::{authenticated_client, checked_body};
use crate::config::{join_url, RunnerConfig};
use crate::error::SchedulerError;

/// Clears what a device published for a session on the upload service,
/// so a rerun never shows stale results
#[derive(Debug, Clone)]
pub struct UploaderClient {
    http: reqwest::Client,
    base_url: String,
    device_id: String,
}

impl UploaderClient {
    pub fn new(config: &RunnerConfig) -> Result<Self, SchedulerError> {
        Ok(Self {
            http: authenticated_client(config)?,
            base_url: config.uploader_url.clone(),
            device_id: config.device.id.clone(),
        })
    }

    fn session_url(&self, session_id: &str) -> String {
        join_url(
            &self.base_url,
            &format!(
                "api/download/sessions/{}/devices/{}",
                session_id, self.device_id
            ),
        )
    }

    /// Delete this device's artifacts for `session_id`
    pub async fn reset_session(&self, session_id: &str) -> Result<(), SchedulerError> {
        let url = self.session_url(session_id);
        log::info!("Resetting uploaded data: {}", url);
        let response = self.http.delete(&url).send().await?;
        checked_body(response).await?;
        Ok(())
    }
}

//! Terminal-state webhook delivery.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::NotifierConfig;
use crate::error::{Result, SubflowError};
use crate::event::Event;
use crate::job::{Job, JobError, JobId, JobOutput, JobStatus};

/// Body POSTed to the webhook when a job reaches a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub job_id: JobId,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<JobOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub duration_ms: u64,
    pub events: Vec<Event>,
}

impl NotificationPayload {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            output: job.output.clone(),
            error: job.error.clone(),
            duration_ms: job.metadata.actual_processing_time_ms.unwrap_or_default(),
            events: job.events.clone(),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, payload: NotificationPayload) -> Result<()>;

    /// Where notifications go; recorded on notification events.
    fn endpoint(&self) -> String;
}

pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new<S: Into<String>>(url: S, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    /// `None` when no webhook URL is configured.
    pub fn from_config(config: &NotifierConfig) -> Result<Option<Self>> {
        config
            .webhook_url
            .as_ref()
            .map(|url| Self::new(url.clone(), Duration::from_secs(config.timeout_secs)))
            .transpose()
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, payload: NotificationPayload) -> Result<()> {
        debug!("Posting {} notification for job {} to {}", payload.status, payload.job_id, self.url);
        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| SubflowError::Notification(format!("Webhook request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SubflowError::Notification(format!("Webhook returned {}: {}", status, body)));
        }
        Ok(())
    }

    fn endpoint(&self) -> String {
        self.url.clone()
    }
}

//! Job outcome notifiers.
//!
//! Notifications are best effort: delivery failures are logged and never
//! reach the pipeline.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;

use crate::pipeline::stages::Notifier;
use crate::scheduler::job::{JobId, JobStatus};

/// Timeout for a single webhook delivery.
const WEBHOOK_TIMEOUT_SECS: u64 = 10;

/// Logs every notification through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, job_id: JobId, status: JobStatus, error: Option<&str>) {
        match (status, error) {
            (JobStatus::Failed, error) => {
                tracing::warn!(job_id = job_id, error = error.unwrap_or("unknown"), "Job failed")
            }
            (status, Some(error)) => {
                tracing::info!(job_id = job_id, status = %status, error = error, "Job notification")
            }
            (status, None) => tracing::info!(job_id = job_id, status = %status, "Job notification"),
        }
    }
}

/// Body posted to the webhook.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload<'a> {
    pub job_id: JobId,
    pub status: JobStatus,
    pub error: Option<&'a str>,
    pub timestamp: DateTime<Utc>,
}

/// Posts each notification as JSON to a webhook URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    /// Creates a notifier posting to `url`.
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(WEBHOOK_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, job_id: JobId, status: JobStatus, error: Option<&str>) {
        let payload = WebhookPayload {
            job_id,
            status,
            error,
            timestamp: Utc::now(),
        };

        let result = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .and_then(|response| response.error_for_status());

        match result {
            Ok(_) => tracing::debug!(job_id = job_id, status = %status, "Delivered webhook notification"),
            Err(e) => tracing::warn!(
                job_id = job_id,
                status = %status,
                error = %e,
                "Webhook notification failed"
            ),
        }
    }
}

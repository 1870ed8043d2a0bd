//! Webhook side effect for ingested events.

use async_trait::async_trait;
use marksync_jobs::{Job, JobError, JobHandler, JobResult};
use marksync_sync::JobPlanner;
use marksync_types::SyncEvent;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

/// Job kind of webhook deliveries.
pub const WEBHOOK_JOB: &str = "webhook";

/// Plans one webhook delivery per ingested event.
#[derive(Debug, Clone)]
pub struct WebhookPlanner {
    url: String,
}

impl WebhookPlanner {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl JobPlanner for WebhookPlanner {
    fn jobs_for(&self, event: &SyncEvent) -> Vec<Job> {
        match serde_json::to_value(event) {
            Ok(body) => vec![Job::new(WEBHOOK_JOB, json!({ "url": self.url, "event": body }))],
            Err(e) => {
                warn!(event = %event.id, error = %e, "could not serialize event for webhook");
                Vec::new()
            }
        }
    }
}

/// POSTs the event JSON of a webhook job. Non-2xx responses fail the
/// attempt so the dispatcher retries it.
#[derive(Debug, Clone)]
pub struct WebhookHandler {
    client: Client,
}

impl WebhookHandler {
    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl JobHandler for WebhookHandler {
    async fn run(&self, job: &Job) -> JobResult<()> {
        let url = job
            .payload
            .get("url")
            .and_then(|url| url.as_str())
            .ok_or_else(|| JobError::failed("webhook job without url"))?;
        let event = job
            .payload
            .get("event")
            .ok_or_else(|| JobError::failed("webhook job without event"))?;

        let response = self
            .client
            .post(url)
            .json(event)
            .send()
            .await
            .map_err(|e| JobError::failed(format!("webhook request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(JobError::failed(format!("webhook returned {status}")));
        }
        debug!(job_id = %job.id, %status, "webhook delivered");
        Ok(())
    }
}

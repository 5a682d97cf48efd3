//! Fetching task batches from the control plane.

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use tether_types::task::{FetchReason, TaskBatch};
use tether_types::{AgentConfig, AgentError};

/// Seam between the engine and the control-plane HTTP surface.
#[async_trait]
pub trait TaskFetcher: Send + Sync {
    async fn fetch_tasks(
        &self,
        reason: FetchReason,
        task_id: &str,
        task_type: i32,
        coldstart: bool,
    ) -> Result<TaskBatch, AgentError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FetchRequest<'a> {
    reason: &'a str,
    task_id: &'a str,
    task_type: i32,
    coldstart: bool,
}

/// Production fetcher posting to the region task endpoint.
pub struct HttpTaskFetcher {
    client: reqwest::Client,
    url: String,
}

impl HttpTaskFetcher {
    pub fn new(config: &AgentConfig) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.http_timeout_secs))
            .build()
            .map_err(|e| AgentError::Http(format!("build http client: {e}")))?;
        Ok(Self {
            client,
            url: config.task_fetch_url(),
        })
    }
}

#[async_trait]
impl TaskFetcher for HttpTaskFetcher {
    async fn fetch_tasks(
        &self,
        reason: FetchReason,
        task_id: &str,
        task_type: i32,
        coldstart: bool,
    ) -> Result<TaskBatch, AgentError> {
        let body = FetchRequest {
            reason: match reason {
                FetchReason::Kick => "kick",
                FetchReason::Routine => "routine",
            },
            task_id,
            task_type,
            coldstart,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Http(format!("task fetch: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::Http(format!("task fetch returned {status}")));
        }

        let batch: TaskBatch = response
            .json()
            .await
            .map_err(|e| AgentError::Http(format!("decode task batch: {e}")))?;
        debug!(count = batch.len(), "task batch fetched");
        Ok(batch)
    }
}

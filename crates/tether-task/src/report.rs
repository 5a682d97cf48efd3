//! Posting task status transitions back to the control plane.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use tether_types::{AgentConfig, AgentError};

/// How many times a status post is attempted before giving up.
const REPORT_ATTEMPTS: u32 = 3;

/// Status values the control plane accepts for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskReportStatus {
    Running,
    Finished,
    Failed,
    Timeout,
    Canceled,
    Invalid,
}

/// Seam for reporting status; the engine takes any implementation.
#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn report(
        &self,
        task_id: &str,
        status: TaskReportStatus,
        exit_code: Option<i32>,
    ) -> Result<(), AgentError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReportBody<'a> {
    task_id: &'a str,
    status: TaskReportStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    exit_code: Option<i32>,
}

/// Production reporter with a bounded retry loop.
pub struct HttpStatusReporter {
    client: reqwest::Client,
    url: String,
    backoff: Duration,
}

impl HttpStatusReporter {
    pub fn new(config: &AgentConfig) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .map_err(|e| AgentError::Http(format!("build http client: {e}")))?;
        Ok(Self {
            client,
            url: config.task_report_url(),
            backoff: Duration::from_secs(2),
        })
    }

    /// Shorten the retry backoff; tests use this to stay fast.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    async fn post_once(&self, body: &ReportBody<'_>) -> Result<(), AgentError> {
        let response = self
            .client
            .post(&self.url)
            .json(body)
            .send()
            .await
            .map_err(|e| AgentError::Http(format!("status report: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::Http(format!("status report returned {status}")));
        }
        Ok(())
    }
}

#[async_trait]
impl StatusReporter for HttpStatusReporter {
    async fn report(
        &self,
        task_id: &str,
        status: TaskReportStatus,
        exit_code: Option<i32>,
    ) -> Result<(), AgentError> {
        let body = ReportBody {
            task_id,
            status,
            exit_code,
        };

        let mut last_err = None;
        for attempt in 1..=REPORT_ATTEMPTS {
            match self.post_once(&body).await {
                Ok(()) => {
                    info!(task_id, status = ?status, "task status reported");
                    return Ok(());
                }
                Err(e) => {
                    warn!(task_id, attempt, error = %e, "task status report failed");
                    last_err = Some(e);
                    if attempt < REPORT_ATTEMPTS {
                        tokio::time::sleep(self.backoff).await;
                    }
                }
            }
        }
        Err(last_err.expect("at least one attempt was made"))
    }
}

//! Best-effort agent telemetry.

use serde::Serialize;
use tracing::{debug, warn};

use tether_types::{AgentConfig, AgentError};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MetricsEvent<'a> {
    event: &'a str,
    detail: &'a str,
    timestamp_ms: i64,
}

/// Posts telemetry events to the control plane. Failures are logged and
/// swallowed; telemetry never affects agent behaviour.
pub struct MetricsReporter {
    client: reqwest::Client,
    url: String,
}

impl MetricsReporter {
    pub fn new(config: &AgentConfig) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.http_timeout_secs))
            .build()
            .map_err(|e| AgentError::Http(format!("build http client: {e}")))?;
        Ok(Self {
            client,
            url: config.metrics_url(),
        })
    }

    /// Fire one event; errors are logged, never returned.
    pub async fn report(&self, event: &str, detail: &str) {
        let body = MetricsEvent {
            event,
            detail,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        };
        match self.client.post(&self.url).json(&body).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(event, "metrics event reported");
            }
            Ok(response) => {
                warn!(event, status = %response.status(), "metrics endpoint rejected event");
            }
            Err(e) => {
                warn!(event, error = %e, "metrics event dropped");
            }
        }
    }
}

//! Online plugin catalog and package download.
//!
//! Both endpoints are flow-controlled server side, so every call retries
//! up to three times with a short pause between attempts.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use tether_types::plugin::{PluginInfo, PluginStatus};
use tether_types::{AgentConfig, AgentError};

/// Attempts per catalog or download call.
const HTTP_ATTEMPTS: u32 = 3;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PluginListRequest<'a> {
    os_type: &'a str,
    plugin_name: &'a str,
    version: &'a str,
    arch: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct PluginListResponse {
    #[serde(rename = "PluginList", default)]
    plugin_list: Vec<PluginInfo>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PluginStatusRequest<'a> {
    plugin: &'a [PluginStatus],
}

/// Client for `/plugin/list`, `/plugin/health`, and package downloads.
pub struct PluginCatalog {
    client: reqwest::Client,
    list_url: String,
    health_url: String,
    list_backoff: Duration,
    report_backoff: Duration,
}

impl PluginCatalog {
    pub fn new(config: &AgentConfig) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs.max(30)))
            .build()
            .map_err(|e| AgentError::Http(format!("build http client: {e}")))?;
        Ok(Self {
            client,
            list_url: config.plugin_list_url(),
            health_url: config.plugin_health_url(),
            list_backoff: Duration::from_secs(3),
            report_backoff: Duration::from_secs(2),
        })
    }

    /// Shorten the retry pauses; tests use this to stay fast.
    pub fn with_backoffs(mut self, list: Duration, report: Duration) -> Self {
        self.list_backoff = list;
        self.report_backoff = report;
        self
    }

    /// Query the catalog. Empty `version`/`arch` mean "any".
    pub async fn query(
        &self,
        os_type: &str,
        name: &str,
        version: &str,
        arch: &str,
    ) -> Result<Vec<PluginInfo>, AgentError> {
        let body = PluginListRequest {
            os_type,
            plugin_name: name,
            version,
            arch,
        };
        info!(plugin = name, version, arch, "querying plugin catalog");

        let mut last_err = None;
        for attempt in 1..=HTTP_ATTEMPTS {
            match self.query_once(&body).await {
                Ok(list) => return Ok(list),
                Err(e) => {
                    warn!(attempt, error = %e, "plugin list request failed");
                    last_err = Some(e);
                    if attempt < HTTP_ATTEMPTS {
                        tokio::time::sleep(self.list_backoff).await;
                    }
                }
            }
        }
        Err(last_err.expect("at least one attempt was made"))
    }

    async fn query_once(&self, body: &PluginListRequest<'_>) -> Result<Vec<PluginInfo>, AgentError> {
        let response = self
            .client
            .post(&self.list_url)
            .json(body)
            .send()
            .await
            .map_err(|e| AgentError::Http(format!("plugin list: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::Http(format!("plugin list returned {status}")));
        }
        let decoded: PluginListResponse = response
            .json()
            .await
            .map_err(|e| AgentError::Http(format!("decode plugin list: {e}")))?;
        Ok(decoded.plugin_list)
    }

    /// Download a package to `dest`, retrying transient failures.
    pub async fn download(&self, url: &str, dest: &Path) -> Result<(), AgentError> {
        let mut last_err = None;
        for attempt in 1..=HTTP_ATTEMPTS {
            match self.download_once(url, dest).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(attempt, url, error = %e, "package download failed");
                    last_err = Some(e);
                    if attempt < HTTP_ATTEMPTS {
                        tokio::time::sleep(self.list_backoff).await;
                    }
                }
            }
        }
        Err(last_err.expect("at least one attempt was made"))
    }

    async fn download_once(&self, url: &str, dest: &Path) -> Result<(), AgentError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AgentError::Http(format!("download {url}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::Http(format!("download {url} returned {status}")));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| AgentError::Http(format!("download body {url}: {e}")))?;
        tokio::fs::write(dest, &bytes)
            .await
            .map_err(|e| AgentError::Plugin(format!("write {}: {e}", dest.display())))?;
        Ok(())
    }

    /// Upload one plugin's health, retrying transient failures.
    pub async fn report_status(&self, entry: PluginStatus) -> Result<(), AgentError> {
        let statuses = [entry];
        let body = PluginStatusRequest { plugin: &statuses };

        let mut last_err = None;
        for attempt in 1..=HTTP_ATTEMPTS {
            let result = async {
                let response = self
                    .client
                    .post(&self.health_url)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| AgentError::Http(format!("plugin health: {e}")))?;
                let status = response.status();
                if !status.is_success() {
                    return Err(AgentError::Http(format!(
                        "plugin health returned {status}"
                    )));
                }
                Ok(())
            }
            .await;

            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(attempt, error = %e, "plugin status upload failed, will retry");
                    last_err = Some(e);
                    if attempt < HTTP_ATTEMPTS {
                        tokio::time::sleep(self.report_backoff).await;
                    }
                }
            }
        }
        Err(last_err.expect("at least one attempt was made"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_types::plugin::PluginHealth;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn catalog_for(server: &MockServer) -> PluginCatalog {
        let config = AgentConfig {
            server_host: Some(server.uri()),
            ..Default::default()
        };
        PluginCatalog::new(&config)
            .unwrap()
            .with_backoffs(Duration::from_millis(5), Duration::from_millis(5))
    }

    #[tokio::test]
    async fn query_decodes_the_catalog() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/plugin/list"))
            .and(body_partial_json(serde_json::json!({
                "osType": "linux",
                "pluginName": "probe",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "PluginList": [{
                    "name": "probe",
                    "version": "1.2.0",
                    "arch": "amd64",
                    "pluginType": "Once",
                    "url": "https://example.invalid/probe.zip",
                    "md5": "abc",
                }]
            })))
            .mount(&server)
            .await;

        let plugins = catalog_for(&server)
            .query("linux", "probe", "", "")
            .await
            .unwrap();
        assert_eq!(plugins.len(), 1);
        assert_eq!(plugins[0].version, "1.2.0");
    }

    #[tokio::test]
    async fn query_retries_three_times_then_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/plugin/list"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let err = catalog_for(&server)
            .query("linux", "probe", "", "")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn download_writes_the_package() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pkg/probe.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"zipzip".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("probe.zip");
        catalog_for(&server)
            .download(&format!("{}/pkg/probe.zip", server.uri()), &dest)
            .await
            .unwrap();
        assert_eq!(std::fs::read(dest).unwrap(), b"zipzip");
    }

    #[tokio::test]
    async fn download_recovers_from_a_transient_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pkg/probe.zip"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/pkg/probe.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("probe.zip");
        catalog_for(&server)
            .download(&format!("{}/pkg/probe.zip", server.uri()), &dest)
            .await
            .unwrap();
        assert_eq!(std::fs::read(dest).unwrap(), b"ok");
    }

    #[tokio::test]
    async fn report_status_posts_the_health_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/plugin/health"))
            .and(body_partial_json(serde_json::json!({
                "plugin": [{"name": "probe", "version": "1.0", "status": "PERSIST_RUNNING"}]
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        catalog_for(&server)
            .report_status(PluginStatus {
                name: "probe".into(),
                version: "1.0".into(),
                status: PluginHealth::PersistRunning,
            })
            .await
            .unwrap();
    }
}

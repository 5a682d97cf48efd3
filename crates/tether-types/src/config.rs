//! Agent configuration with layered loading.
//!
//! The priority chain (later overrides earlier):
//! 1. Built-in defaults ([`AgentConfig::default()`])
//! 2. TOML file (explicit `--config` path, else `/etc/tether/config.toml`)
//! 3. `TETHER_*` environment variables
//!
//! URL helpers derive every control-plane endpoint from the region id (or
//! an explicit host override, which the hybrid deployment path uses).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::AgentError;

/// Default system-wide config file location.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/tether/config.toml";

/// Agent-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Region id, e.g. "cn-hangzhou". Forms `{region}.axt.aliyun.com`.
    pub region_id: String,
    /// Explicit server host overriding the region-derived one.
    pub server_host: Option<String>,
    /// Root of the on-disk plugin tree.
    pub plugin_dir: PathBuf,
    /// Directory holding the hybrid-registration instance-id file.
    pub hybrid_dir: PathBuf,
    /// Interval of the fallback poll channel, seconds.
    pub poll_interval_secs: u64,
    /// Application-level ping interval of the websocket channel, seconds.
    pub ws_ping_interval_secs: u64,
    /// Timeout applied to control-plane HTTP round-trips, seconds.
    pub http_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            region_id: String::new(),
            server_host: None,
            plugin_dir: PathBuf::from("/usr/local/share/tether/plugin"),
            hybrid_dir: PathBuf::from("/usr/local/share/tether/hybrid"),
            poll_interval_secs: 1800,
            ws_ping_interval_secs: 60,
            http_timeout_secs: 10,
        }
    }
}

impl AgentConfig {
    /// Load configuration: defaults, then the TOML file (if present), then
    /// `TETHER_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, AgentError> {
        let mut config = Self::default();

        let file = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(SYSTEM_CONFIG_PATH));
        if file.exists() {
            let text = std::fs::read_to_string(&file).map_err(|e| {
                AgentError::Config(format!("read {}: {e}", file.display()))
            })?;
            config = toml::from_str(&text).map_err(|e| {
                AgentError::Config(format!("parse {}: {e}", file.display()))
            })?;
        } else if path.is_some() {
            // An explicitly named file must exist; the system default may not.
            return Err(AgentError::Config(format!(
                "config file not found: {}",
                file.display()
            )));
        }

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply `TETHER_*` environment variable overrides in place.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(region) = std::env::var("TETHER_REGION_ID") {
            if !region.is_empty() {
                self.region_id = region;
            }
        }
        if let Ok(host) = std::env::var("TETHER_SERVER_HOST") {
            if !host.is_empty() {
                self.server_host = Some(host);
            }
        }
        if let Ok(dir) = std::env::var("TETHER_PLUGIN_DIR") {
            if !dir.is_empty() {
                self.plugin_dir = PathBuf::from(dir);
            }
        }
        if let Ok(dir) = std::env::var("TETHER_HYBRID_DIR") {
            if !dir.is_empty() {
                self.hybrid_dir = PathBuf::from(dir);
            }
        }
    }

    /// The control-plane host: explicit override, else region-derived.
    pub fn host(&self) -> String {
        match &self.server_host {
            Some(host) => host.clone(),
            None => format!("{}.axt.aliyun.com", self.region_id),
        }
    }

    fn base_url(&self) -> String {
        let host = self.host();
        // Test servers pass a full origin as the override.
        if host.starts_with("http://") || host.starts_with("https://") {
            host
        } else {
            format!("https://{host}")
        }
    }

    pub fn metrics_url(&self) -> String {
        format!("{}/luban/api/metrics", self.base_url())
    }

    pub fn gshell_url(&self) -> String {
        format!("{}/luban/api/gshell", self.base_url())
    }

    pub fn task_fetch_url(&self) -> String {
        format!("{}/luban/api/v1/task/fetch", self.base_url())
    }

    pub fn task_report_url(&self) -> String {
        format!("{}/luban/api/v1/task/status", self.base_url())
    }

    /// Web-socket endpoint the push channel dials.
    pub fn ws_push_url(&self) -> String {
        let base = self.base_url();
        let ws = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            format!("wss://{base}")
        };
        format!("{ws}/luban/notify_server")
    }

    pub fn plugin_list_url(&self) -> String {
        format!("{}/plugin/list", self.base_url())
    }

    pub fn plugin_health_url(&self) -> String {
        format!("{}/plugin/health", self.base_url())
    }

    /// Path of the persisted installed-plugin registry.
    pub fn installed_plugins_path(&self) -> PathBuf {
        self.plugin_dir.join("installed_plugins")
    }

    /// Path of the hybrid-registration instance-id file.
    pub fn instance_id_path(&self) -> PathBuf {
        self.hybrid_dir.join("instance-id")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_derives_endpoints() {
        let config = AgentConfig {
            region_id: "cn-test100".into(),
            ..Default::default()
        };
        assert_eq!(config.host(), "cn-test100.axt.aliyun.com");
        assert_eq!(
            config.gshell_url(),
            "https://cn-test100.axt.aliyun.com/luban/api/gshell"
        );
        assert_eq!(
            config.plugin_list_url(),
            "https://cn-test100.axt.aliyun.com/plugin/list"
        );
    }

    #[test]
    fn explicit_host_overrides_region() {
        let config = AgentConfig {
            region_id: "cn-test100".into(),
            server_host: Some("hybrid.example.com".into()),
            ..Default::default()
        };
        assert_eq!(config.host(), "hybrid.example.com");
        assert_eq!(
            config.metrics_url(),
            "https://hybrid.example.com/luban/api/metrics"
        );
    }

    #[test]
    fn ws_push_url_tracks_the_http_scheme() {
        let config = AgentConfig {
            region_id: "cn-test100".into(),
            ..Default::default()
        };
        assert_eq!(
            config.ws_push_url(),
            "wss://cn-test100.axt.aliyun.com/luban/notify_server"
        );

        let local = AgentConfig {
            server_host: Some("http://127.0.0.1:8080".into()),
            ..Default::default()
        };
        assert_eq!(
            local.ws_push_url(),
            "ws://127.0.0.1:8080/luban/notify_server"
        );
    }

    #[test]
    fn full_origin_override_is_used_verbatim() {
        let config = AgentConfig {
            server_host: Some("http://127.0.0.1:8080".into()),
            ..Default::default()
        };
        assert_eq!(
            config.plugin_health_url(),
            "http://127.0.0.1:8080/plugin/health"
        );
    }

    #[test]
    fn load_reads_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "region_id = \"eu-west-1\"\npoll_interval_secs = 60\n",
        )
        .unwrap();

        let config = AgentConfig::load(Some(&path)).unwrap();
        assert_eq!(config.region_id, "eu-west-1");
        assert_eq!(config.poll_interval_secs, 60);
        // Untouched fields keep their defaults.
        assert_eq!(config.ws_ping_interval_secs, 60);
    }

    #[test]
    fn load_rejects_missing_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        let err = AgentConfig::load(Some(&missing)).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn registry_paths_hang_off_plugin_dir() {
        let config = AgentConfig {
            plugin_dir: PathBuf::from("/tmp/plug"),
            hybrid_dir: PathBuf::from("/tmp/hyb"),
            ..Default::default()
        };
        assert_eq!(
            config.installed_plugins_path(),
            PathBuf::from("/tmp/plug/installed_plugins")
        );
        assert_eq!(
            config.instance_id_path(),
            PathBuf::from("/tmp/hyb/instance-id")
        );
    }
}

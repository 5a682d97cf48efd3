//! Plugin records: the persisted registry format, the package `config.json`
//! schema, and status reporting types.
//!
//! The `pluginType` field in both the catalog response and `config.json` is
//! dynamically typed on the wire: a string (`"Once"`/`"Persist"`) or a
//! number (`1`/`2`). It is parsed into [`PluginType`] once at ingestion and
//! never re-parsed.

use serde::de::Deserializer;
use serde::{Deserialize, Serialize};

/// Fallback timeout applied when a record carries no parseable value.
pub const DEFAULT_PLUGIN_TIMEOUT_SECS: u64 = 60;

/// Fallback heartbeat interval for persist plugins.
pub const DEFAULT_HEARTBEAT_SECS: i64 = 60;

/// Maximum plugin-name length accepted by the status endpoint.
pub const PLUGIN_NAME_MAXLEN: usize = 255;

/// Maximum plugin-version length accepted by the status endpoint.
pub const PLUGIN_VERSION_MAXLEN: usize = 128;

/// How a plugin runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PluginType {
    /// Executed to completion on each invocation, no background state.
    #[default]
    Once,
    /// Long-lived service exposing `--status`, `--stop`, `--uninstall`.
    Persist,
    /// Unrecognised wire value; rejected at use sites.
    Unknown,
}

impl PluginType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginType::Once => "Once",
            PluginType::Persist => "Persist",
            PluginType::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for PluginType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for PluginType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PluginType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // String or numeric type id; absent fields use Default (Once).
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Wire {
            Text(String),
            Id(i64),
        }

        Ok(match Option::<Wire>::deserialize(deserializer)? {
            None => PluginType::Once,
            Some(Wire::Text(s)) => match s.as_str() {
                "Once" => PluginType::Once,
                "Persist" => PluginType::Persist,
                _ => PluginType::Unknown,
            },
            Some(Wire::Id(1)) => PluginType::Once,
            Some(Wire::Id(2)) => PluginType::Persist,
            Some(Wire::Id(_)) => PluginType::Unknown,
        })
    }
}

/// One installed (or soft-deleted) plugin record.
///
/// The registry invariant is at most one record per `name` with
/// `is_removed == false`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PluginInfo {
    pub plugin_id: String,
    pub name: String,
    pub version: String,
    pub publisher: String,
    pub os_type: String,
    pub arch: String,
    /// Executable path relative to the versioned plugin directory.
    pub run_path: String,
    /// Timeout in seconds, kept as the wire string; see [`PluginInfo::timeout_secs`].
    pub timeout: String,
    pub plugin_type: PluginType,
    pub url: String,
    pub md5: String,
    pub heartbeat_interval: i64,
    pub is_removed: bool,
}

impl PluginInfo {
    /// Parsed timeout with the 60-second fallback.
    pub fn timeout_secs(&self) -> u64 {
        self.timeout
            .parse::<u64>()
            .ok()
            .filter(|t| *t > 0)
            .unwrap_or(DEFAULT_PLUGIN_TIMEOUT_SECS)
    }

    /// Heartbeat interval, defaulting to 60 when non-positive.
    pub fn heartbeat_secs(&self) -> i64 {
        if self.heartbeat_interval > 0 {
            self.heartbeat_interval
        } else {
            DEFAULT_HEARTBEAT_SECS
        }
    }
}

/// The `config.json` found at the top of a plugin package.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PluginPackageConfig {
    pub name: String,
    pub arch: String,
    pub os_type: String,
    pub run_path: String,
    pub timeout: String,
    pub publisher: String,
    pub version: String,
    pub plugin_type: PluginType,
    pub heartbeat_interval: i64,
}

impl PluginPackageConfig {
    pub fn timeout_secs(&self) -> u64 {
        self.timeout
            .parse::<u64>()
            .ok()
            .filter(|t| *t > 0)
            .unwrap_or(DEFAULT_PLUGIN_TIMEOUT_SECS)
    }
}

/// The serialized shape of the `installed_plugins` file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstalledPlugins {
    pub plugin_list: Vec<PluginInfo>,
}

/// Reported health of one plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginHealth {
    PersistRunning,
    PersistFail,
    PersistUnknown,
    Removed,
}

impl PluginHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginHealth::PersistRunning => "PERSIST_RUNNING",
            PluginHealth::PersistFail => "PERSIST_FAIL",
            PluginHealth::PersistUnknown => "PERSIST_UNKNOWN",
            PluginHealth::Removed => "REMOVED",
        }
    }
}

impl std::fmt::Display for PluginHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for PluginHealth {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PluginHealth {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "PERSIST_RUNNING" => PluginHealth::PersistRunning,
            "PERSIST_FAIL" => PluginHealth::PersistFail,
            "REMOVED" => PluginHealth::Removed,
            _ => PluginHealth::PersistUnknown,
        })
    }
}

/// One entry of a status upload or `show-status` listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginStatus {
    pub name: String,
    pub version: String,
    pub status: PluginHealth,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_type_from_string() {
        let once: PluginType = serde_json::from_str("\"Once\"").unwrap();
        assert_eq!(once, PluginType::Once);
        let persist: PluginType = serde_json::from_str("\"Persist\"").unwrap();
        assert_eq!(persist, PluginType::Persist);
        let other: PluginType = serde_json::from_str("\"Daemon\"").unwrap();
        assert_eq!(other, PluginType::Unknown);
    }

    #[test]
    fn plugin_type_from_number() {
        let once: PluginType = serde_json::from_str("1").unwrap();
        assert_eq!(once, PluginType::Once);
        let persist: PluginType = serde_json::from_str("2").unwrap();
        assert_eq!(persist, PluginType::Persist);
        let other: PluginType = serde_json::from_str("9").unwrap();
        assert_eq!(other, PluginType::Unknown);
    }

    #[test]
    fn plugin_type_absent_defaults_to_once() {
        let info: PluginInfo = serde_json::from_str(r#"{"name": "probe"}"#).unwrap();
        assert_eq!(info.plugin_type, PluginType::Once);
    }

    #[test]
    fn timeout_falls_back_to_sixty() {
        let mut info = PluginInfo {
            timeout: "120".into(),
            ..Default::default()
        };
        assert_eq!(info.timeout_secs(), 120);

        info.timeout = "not-a-number".into();
        assert_eq!(info.timeout_secs(), 60);

        info.timeout = "0".into();
        assert_eq!(info.timeout_secs(), 60);

        info.timeout.clear();
        assert_eq!(info.timeout_secs(), 60);
    }

    #[test]
    fn heartbeat_defaults_when_non_positive() {
        let mut info = PluginInfo {
            heartbeat_interval: 30,
            ..Default::default()
        };
        assert_eq!(info.heartbeat_secs(), 30);

        info.heartbeat_interval = 0;
        assert_eq!(info.heartbeat_secs(), 60);

        info.heartbeat_interval = -5;
        assert_eq!(info.heartbeat_secs(), 60);
    }

    #[test]
    fn package_config_accepts_numeric_plugin_type() {
        let config: PluginPackageConfig = serde_json::from_str(
            r#"{"name": "logtail", "version": "1.2.0", "runPath": "bin/start.sh", "pluginType": 2}"#,
        )
        .unwrap();
        assert_eq!(config.plugin_type, PluginType::Persist);
        assert_eq!(config.run_path, "bin/start.sh");
    }

    #[test]
    fn installed_plugins_round_trips_through_json() {
        let registry = InstalledPlugins {
            plugin_list: vec![PluginInfo {
                name: "probe".into(),
                version: "1.0".into(),
                plugin_type: PluginType::Persist,
                ..Default::default()
            }],
        };
        let text = serde_json::to_string(&registry).unwrap();
        let back: InstalledPlugins = serde_json::from_str(&text).unwrap();
        assert_eq!(back.plugin_list.len(), 1);
        assert_eq!(back.plugin_list[0].name, "probe");
        assert_eq!(back.plugin_list[0].plugin_type, PluginType::Persist);
    }

    #[test]
    fn health_serializes_screaming_case() {
        let status = PluginStatus {
            name: "probe".into(),
            version: "1.0".into(),
            status: PluginHealth::PersistRunning,
        };
        let text = serde_json::to_string(&status).unwrap();
        assert!(text.contains("\"PERSIST_RUNNING\""));
    }
}

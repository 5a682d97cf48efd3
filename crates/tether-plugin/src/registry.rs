//! The persisted installed-plugin registry.
//!
//! One JSON file under the plugin root. Every write goes through a temp
//! file in the same directory followed by an atomic rename, so a crash
//! leaves either the old or the new registry, never a truncated one.

use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use tether_types::plugin::{InstalledPlugins, PluginInfo};
use tether_types::AgentError;

/// Load/store interface over the `installed_plugins` file.
pub struct PluginRegistry {
    path: PathBuf,
}

impl PluginRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the installed set. A missing file is an empty registry.
    pub fn load(&self) -> Result<Vec<PluginInfo>, AgentError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let text = std::fs::read_to_string(&self.path).map_err(|e| {
            AgentError::Plugin(format!("read {}: {e}", self.path.display()))
        })?;
        let installed: InstalledPlugins = serde_json::from_str(&text).map_err(|e| {
            AgentError::Plugin(format!("parse {}: {e}", self.path.display()))
        })?;
        Ok(installed.plugin_list)
    }

    /// Atomically replace the installed set.
    pub fn save(&self, plugins: &[PluginInfo]) -> Result<(), AgentError> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| AgentError::Plugin("registry path has no parent".into()))?;
        std::fs::create_dir_all(parent)
            .map_err(|e| AgentError::Plugin(format!("create {}: {e}", parent.display())))?;

        let body = serde_json::to_string_pretty(&InstalledPlugins {
            plugin_list: plugins.to_vec(),
        })
        .map_err(|e| AgentError::Plugin(format!("encode registry: {e}")))?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| AgentError::Plugin(format!("temp registry file: {e}")))?;
        tmp.write_all(body.as_bytes())
            .map_err(|e| AgentError::Plugin(format!("write registry: {e}")))?;
        tmp.flush()
            .map_err(|e| AgentError::Plugin(format!("flush registry: {e}")))?;
        tmp.persist(&self.path)
            .map_err(|e| AgentError::Plugin(format!("replace registry: {e}")))?;

        debug!(path = %self.path.display(), count = plugins.len(), "registry persisted");
        Ok(())
    }

    /// Index of the non-removed record with this name.
    pub fn find_active(plugins: &[PluginInfo], name: &str) -> Option<usize> {
        plugins
            .iter()
            .position(|p| p.name == name && !p.is_removed)
    }

    /// Index of any record with this name, removed or not.
    pub fn find_any(plugins: &[PluginInfo], name: &str) -> Option<usize> {
        plugins.iter().position(|p| p.name == name)
    }
}

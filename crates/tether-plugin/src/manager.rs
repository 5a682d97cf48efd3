//! Install, execute, remove, verify, list, and report plugins.
//!
//! Packages are zips with a `config.json` at the top level (or one level
//! below, which some packagers produce). Installed working copies live
//! under `{plugin_dir}/{name}/{version}/`; the registry file records the
//! installed set with soft deletes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use tether_process::{CommandSpec, ProcessRunner, RunStatus};
use tether_types::exit::ExitCode;
use tether_types::plugin::{
    PluginHealth, PluginInfo, PluginPackageConfig, PluginStatus, PluginType,
    PLUGIN_NAME_MAXLEN, PLUGIN_VERSION_MAXLEN,
};
use tether_types::{AgentConfig, AgentError};

use crate::catalog::PluginCatalog;
use crate::registry::PluginRegistry;
use crate::version;

/// Parameters that can change a persist plugin's service state; an
/// invocation using one of these is followed by a `--status` report.
const NEED_REFRESH_STATUS_PARAMS: &[&str] = &[
    "--install",
    "--start",
    "--stop",
    "--restart",
    "--upgrade",
    "--uninstall",
];

/// A failed plugin operation: exactly one taxonomy pair plus detail.
#[derive(Debug)]
pub struct OpError {
    pub code: ExitCode,
    pub detail: String,
}

impl OpError {
    fn new(code: ExitCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for OpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.code.prefix(), self.detail)
    }
}

impl std::error::Error for OpError {}

/// `Ok` carries the plugin's own exit code (zero on the non-execute ops).
pub type OpResult = Result<i32, OpError>;

/// The plugin-manager front end.
pub struct PluginManager {
    config: AgentConfig,
    registry: PluginRegistry,
    catalog: PluginCatalog,
    runner: Arc<dyn ProcessRunner>,
    verbose: bool,
    /// Proceed without prompting on same-or-older reinstalls. Default.
    assume_yes: bool,
}

impl PluginManager {
    pub fn new(config: AgentConfig, runner: Arc<dyn ProcessRunner>) -> Result<Self, AgentError> {
        let catalog = PluginCatalog::new(&config)?;
        Ok(Self {
            registry: PluginRegistry::new(config.installed_plugins_path()),
            config,
            catalog,
            runner,
            verbose: false,
            assume_yes: true,
        })
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Swap the catalog client (tests point it at a mock server).
    pub fn with_catalog(mut self, catalog: PluginCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    // -----------------------------------------------------------------
    // list / status
    // -----------------------------------------------------------------

    /// Print the installed (or online) plugin set.
    pub async fn list(&self, name: &str, local: bool) -> OpResult {
        let plugins = if local {
            let mut plugins = self
                .registry
                .load()
                .map_err(|e| OpError::new(ExitCode::LoadInstalledPluginsErr, e.to_string()))?;
            if !name.is_empty() {
                plugins.retain(|p| p.name == name);
            }
            plugins
        } else {
            self.catalog
                .query(host_os(), name, "", host_arch())
                .await
                .map_err(|e| OpError::new(ExitCode::GetOnlinePackageInfoErr, e.to_string()))?
        };

        println!(
            "{:<24} {:<12} {:<16} {:<8} {:<8} {:<8}",
            "Name", "Version", "Publisher", "OsType", "Arch", "Type"
        );
        for plugin in plugins.iter().filter(|p| !p.is_removed) {
            println!(
                "{:<24} {:<12} {:<16} {:<8} {:<8} {:<8}",
                plugin.name,
                plugin.version,
                plugin.publisher,
                plugin.os_type,
                plugin.arch,
                plugin.plugin_type
            );
        }
        Ok(0)
    }

    /// Poll every installed persist plugin with `--status` and print the
    /// serialized result list.
    pub async fn show_status(&self) -> OpResult {
        let statuses = self
            .collect_status()
            .await
            .map_err(|e| OpError::new(ExitCode::LoadInstalledPluginsErr, e.to_string()))?;
        let body = serde_json::to_string_pretty(&statuses)
            .map_err(|e| OpError::new(ExitCode::ParseConfigErr, format!("encode status: {e}")))?;
        println!("{body}");
        Ok(0)
    }

    /// Gather the status of every installed persist plugin: removed
    /// records report `Removed`, live ones are polled with `--status`.
    /// Backs the `status` subcommand and the daemon's plugin heartbeat.
    pub async fn collect_status(&self) -> Result<Vec<PluginStatus>, AgentError> {
        let plugins = self.registry.load()?;
        info!(count = plugins.len(), "checking installed plugin status");

        let mut statuses = Vec::new();
        for plugin in &plugins {
            if plugin.plugin_type != PluginType::Persist {
                continue;
            }
            let health = if plugin.is_removed {
                PluginHealth::Removed
            } else {
                let plugin_dir = self.versioned_dir(&plugin.name, &plugin.version);
                let cmd_path = plugin_dir.join(&plugin.run_path);
                let env = plugin_env(&plugin_dir, None);
                match self
                    .execute_plugin(&cmd_path, &["--status".into()], plugin.timeout_secs(), &env, true)
                    .await
                {
                    Ok(0) => PluginHealth::PersistRunning,
                    _ => PluginHealth::PersistFail,
                }
            };
            statuses.push(PluginStatus {
                name: plugin.name.clone(),
                version: plugin.version.clone(),
                status: health,
            });
        }
        Ok(statuses)
    }

    /// Cadence of the daemon's plugin heartbeat: the smallest configured
    /// interval across active persist plugins, 60 seconds when none are
    /// installed or the registry is unreadable.
    pub fn heartbeat_interval(&self) -> Duration {
        let secs = self
            .registry
            .load()
            .ok()
            .and_then(|plugins| {
                plugins
                    .iter()
                    .filter(|p| p.plugin_type == PluginType::Persist && !p.is_removed)
                    .map(|p| p.heartbeat_secs())
                    .min()
            })
            .unwrap_or(tether_types::plugin::DEFAULT_HEARTBEAT_SECS);
        Duration::from_secs(secs.max(1) as u64)
    }

    // -----------------------------------------------------------------
    // execute
    // -----------------------------------------------------------------

    /// CLI entry: split the parameter string and route to the file or
    /// online-or-local path.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute(
        &self,
        file: &str,
        name: &str,
        params: &str,
        separator: &str,
        params_v2: &str,
        pin_version: &str,
        local: bool,
    ) -> OpResult {
        let params = split_params(params, separator, params_v2);
        if self.verbose {
            info!(file, name, ?params, pin_version, local, "execute plugin");
        }
        if !file.is_empty() {
            self.execute_from_file(Path::new(file), &params).await
        } else {
            self.execute_online_or_local(name, pin_version, &params, local)
                .await
        }
    }

    /// Install (or upgrade) from a local `.zip` and run it.
    pub async fn execute_from_file(&self, file: &Path, params: &[String]) -> OpResult {
        if !file.exists() {
            return Err(OpError::new(
                ExitCode::PackageNotFound,
                format!("package file not found: {}", file.display()),
            ));
        }
        let stem = match file.extension().and_then(|e| e.to_str()) {
            Some("zip") => file
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string(),
            _ => {
                return Err(OpError::new(
                    ExitCode::PackageFormatErr,
                    format!("package is not a zip file: {}", file.display()),
                ))
            }
        };

        // Unzip next to the package.
        let mut scratch = file
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(&stem);
        unzip(file, &scratch)?;

        // config.json at the top level or one level below.
        let mut config_path = scratch.join("config.json");
        if !config_path.exists() {
            let nested = scratch.join(&stem);
            config_path = nested.join("config.json");
            if !config_path.exists() {
                return Err(OpError::new(
                    ExitCode::PluginFormatErr,
                    "config.json not found in package",
                ));
            }
            scratch = nested;
        }
        let package = parse_package_config(&config_path)?;
        check_host_match(&package)?;

        let mut plugins = self
            .registry
            .load()
            .map_err(|e| OpError::new(ExitCode::LoadInstalledPluginsErr, e.to_string()))?;

        // A soft-deleted record of the same name counts as absent.
        let mut index = PluginRegistry::find_any(&plugins, &package.name);
        if let Some(i) = index {
            if plugins[i].is_removed {
                plugins.remove(i);
                index = None;
            }
        }

        let mut pre_plugin_dir = None;
        if let Some(i) = index {
            let existing = &plugins[i];
            pre_plugin_dir = Some(self.versioned_dir(&existing.name, &existing.version));
            if version::is_newer(&package.version, &existing.version) {
                info!(
                    plugin = %existing.name,
                    from = %existing.version,
                    to = %package.version,
                    "upgrading installed plugin"
                );
            } else {
                // With interactive confirm off (the default) a
                // same-or-older package still installs, loudly.
                warn!(
                    plugin = %existing.name,
                    installed = %existing.version,
                    package = %package.version,
                    proceed = self.assume_yes,
                    "package version is not newer than the installed one"
                );
            }
        }

        let timeout = package.timeout_secs();
        let md5 = compute_md5(file)?;

        // Upgrades keep the identity the record was first installed
        // under; only a fresh install mints one.
        let plugin_id = match index {
            Some(i) => plugins[i].plugin_id.clone(),
            None => format!("local_{}_{}", package.name, package.version),
        };
        let mut record = PluginInfo {
            plugin_id,
            name: package.name.clone(),
            version: package.version.clone(),
            publisher: package.publisher.clone(),
            os_type: package.os_type.clone(),
            arch: package.arch.clone(),
            run_path: package.run_path.clone(),
            timeout: timeout.to_string(),
            plugin_type: package.plugin_type,
            url: "local".into(),
            md5,
            heartbeat_interval: package.heartbeat_interval,
            is_removed: false,
        };
        if record.heartbeat_interval <= 0 {
            record.heartbeat_interval = 60;
        }

        // Copy the working tree into place.
        let target = self.versioned_dir(&record.name, &record.version);
        copy_dir(&scratch, &target)?;
        let cmd_path = target.join(&record.run_path);
        if !cmd_path.exists() {
            return Err(OpError::new(
                ExitCode::PluginFormatErr,
                format!("executable not found: {}", cmd_path.display()),
            ));
        }
        make_executable(&cmd_path)?;

        match index {
            Some(i) => plugins[i] = record.clone(),
            None => plugins.push(record.clone()),
        }
        self.registry
            .save(&plugins)
            .map_err(|e| OpError::new(ExitCode::DumpInstalledPluginsErr, e.to_string()))?;
        info!(plugin = %record.name, version = %record.version, "plugin installed");
        let _ = std::fs::remove_dir_all(&scratch);

        let env = plugin_env(&target, pre_plugin_dir.as_deref());
        let result = self
            .execute_plugin(&cmd_path, params, timeout, &env, false)
            .await;
        if record.plugin_type == PluginType::Persist && needs_status_refresh(params) {
            let (health, report) = self
                .check_and_report(&record.name, &record.version, &cmd_path, timeout, &env)
                .await;
            info!(plugin = %record.name, health = %health, ok = report.is_ok(), "post-install status check");
        }
        result
    }

    /// Execute by name: prefer the local copy on a version tie, otherwise
    /// pull the online package.
    pub async fn execute_online_or_local(
        &self,
        name: &str,
        pin_version: &str,
        params: &[String],
        local_only: bool,
    ) -> OpResult {
        let local_info = self
            .find_local(name, pin_version)
            .map_err(|e| OpError::new(ExitCode::LoadInstalledPluginsErr, e.to_string()))?;

        if local_only {
            let Some(info) = local_info else {
                return Err(OpError::new(
                    ExitCode::PackageNotFound,
                    format!("no local package {name} {pin_version}"),
                ));
            };
            return self.run_installed(&info, params).await;
        }

        let (online_info, other_arches) = self
            .find_online(name, pin_version)
            .await
            .map_err(|e| OpError::new(ExitCode::GetOnlinePackageInfoErr, e.to_string()))?;

        let use_local = match (&local_info, &online_info) {
            (Some(local), Some(online)) => {
                let tie = version::compare(&local.version, &online.version)
                    == std::cmp::Ordering::Equal;
                if tie {
                    info!(
                        plugin = name,
                        local = %local.version,
                        online = %online.version,
                        "local version matches online, using local package"
                    );
                } else {
                    info!(
                        plugin = name,
                        local = %local.version,
                        online = %online.version,
                        "local version differs from online, using online package"
                    );
                }
                tie
            }
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => {
                let detail = if other_arches.is_empty() {
                    format!("package {name} {pin_version} found neither locally nor online")
                } else {
                    format!(
                        "no local package {name}; online package arch [{}] does not match host arch {}",
                        other_arches.join(", "),
                        host_arch()
                    )
                };
                return Err(OpError::new(ExitCode::PackageNotFound, detail));
            }
        };

        if use_local {
            let info = local_info.expect("use_local implies a local record");
            return self.run_installed(&info, params).await;
        }

        let online = online_info.expect("online path implies an online record");
        self.install_online_package(&online, params).await
    }

    /// Run the already-installed working copy of a plugin.
    async fn run_installed(&self, info: &PluginInfo, params: &[String]) -> OpResult {
        let plugin_dir = self.versioned_dir(&info.name, &info.version);
        let cmd_path = plugin_dir.join(&info.run_path);
        let env = plugin_env(&plugin_dir, None);
        let timeout = info.timeout_secs();

        let result = self
            .execute_plugin(&cmd_path, params, timeout, &env, false)
            .await;
        if info.plugin_type == PluginType::Persist && needs_status_refresh(params) {
            let (health, report) = self
                .check_and_report(&info.name, &info.version, &cmd_path, timeout, &env)
                .await;
            info!(plugin = %info.name, health = %health, ok = report.is_ok(), "post-run status check");
        }
        result
    }

    /// Download, verify, unpack, register, and run an online package.
    async fn install_online_package(&self, online: &PluginInfo, params: &[String]) -> OpResult {
        let archive = self.config.plugin_dir.join(format!("{}.zip", online.name));
        std::fs::create_dir_all(&self.config.plugin_dir).map_err(|e| {
            OpError::new(
                ExitCode::DownloadFail,
                format!("create plugin dir: {e}"),
            )
        })?;
        info!(url = %online.url, dest = %archive.display(), "downloading plugin package");
        self.catalog
            .download(&online.url, &archive)
            .await
            .map_err(|e| OpError::new(ExitCode::DownloadFail, e.to_string()))?;

        let md5 = compute_md5(&archive)?;
        if !md5.eq_ignore_ascii_case(&online.md5) {
            return Err(OpError::new(
                ExitCode::Md5CheckFail,
                format!("md5 mismatch: catalog {} package {md5}", online.md5),
            ));
        }

        let target = self.versioned_dir(&online.name, &online.version);
        unzip(&archive, &target)?;
        let _ = std::fs::remove_file(&archive);

        let config_path = target.join("config.json");
        if !config_path.exists() {
            return Err(OpError::new(
                ExitCode::PluginFormatErr,
                "config.json not found in package",
            ));
        }
        let package = parse_package_config(&config_path)?;
        check_host_match(&package)?;
        if package.plugin_type != online.plugin_type {
            return Err(OpError::new(
                ExitCode::PluginFormatErr,
                format!(
                    "package type {} does not match catalog type {}",
                    package.plugin_type, online.plugin_type
                ),
            ));
        }

        let cmd_path = target.join(&package.run_path);
        if !cmd_path.exists() {
            return Err(OpError::new(
                ExitCode::PluginFormatErr,
                format!("executable not found: {}", cmd_path.display()),
            ));
        }
        make_executable(&cmd_path)?;

        // The catalog response has no heartbeat field; the package config
        // is authoritative for it.
        let mut record = online.clone();
        record.plugin_type = package.plugin_type;
        record.heartbeat_interval = if package.heartbeat_interval > 0 {
            package.heartbeat_interval
        } else {
            60
        };
        record.run_path = package.run_path.clone();
        record.is_removed = false;
        let timeout = package.timeout_secs();
        record.timeout = timeout.to_string();

        let mut plugins = self
            .registry
            .load()
            .map_err(|e| OpError::new(ExitCode::LoadInstalledPluginsErr, e.to_string()))?;
        let mut index = PluginRegistry::find_any(&plugins, &record.name);
        if let Some(i) = index {
            if plugins[i].is_removed {
                plugins.remove(i);
                index = None;
            }
        }
        let pre_plugin_dir = index.map(|i| {
            let previous = &plugins[i];
            self.versioned_dir(&previous.name, &previous.version)
        });
        match index {
            Some(i) => plugins[i] = record.clone(),
            None => plugins.push(record.clone()),
        }
        self.registry
            .save(&plugins)
            .map_err(|e| OpError::new(ExitCode::DumpInstalledPluginsErr, e.to_string()))?;

        let env = plugin_env(&target, pre_plugin_dir.as_deref());
        let result = self
            .execute_plugin(&cmd_path, params, timeout, &env, false)
            .await;
        if record.plugin_type == PluginType::Persist && needs_status_refresh(params) {
            let (health, report) = self
                .check_and_report(&record.name, &record.version, &cmd_path, timeout, &env)
                .await;
            info!(plugin = %record.name, health = %health, ok = report.is_ok(), "post-install status check");
        }
        result
    }

    // -----------------------------------------------------------------
    // remove / verify
    // -----------------------------------------------------------------

    /// Remove a plugin by name: soft-delete the record, report, and wipe
    /// the plugin's directory tree (all versions).
    pub async fn remove(&self, name: &str) -> OpResult {
        let mut plugins = self
            .registry
            .load()
            .map_err(|e| OpError::new(ExitCode::LoadInstalledPluginsErr, e.to_string()))?;
        let Some(index) = PluginRegistry::find_active(&plugins, name) else {
            return Err(OpError::new(
                ExitCode::PackageNotFound,
                format!("plugin {name} not found in installed registry"),
            ));
        };

        let record = plugins[index].clone();
        if record.plugin_type == PluginType::Persist {
            let plugin_dir = self.versioned_dir(&record.name, &record.version);
            let cmd_path = plugin_dir.join(&record.run_path);
            let env = plugin_env(&plugin_dir, None);
            let timeout = record.timeout_secs();

            // Stop is best-effort; uninstall failure aborts the removal.
            if let Err(e) = self
                .execute_plugin(&cmd_path, &["--stop".into()], timeout, &env, false)
                .await
            {
                debug!(plugin = name, error = %e, "--stop failed, continuing");
            }
            self.execute_plugin(&cmd_path, &["--uninstall".into()], timeout, &env, false)
                .await?;
        }

        plugins[index].is_removed = true;
        self.registry
            .save(&plugins)
            .map_err(|e| OpError::new(ExitCode::DumpInstalledPluginsErr, e.to_string()))?;

        if let Err(e) = self
            .report_status(&record.name, &record.version, PluginHealth::Removed)
            .await
        {
            warn!(plugin = name, error = %e, "removed, but status report failed");
        }

        let tree = self.config.plugin_dir.join(&record.name);
        if tree.exists() {
            std::fs::remove_dir_all(&tree).map_err(|e| {
                OpError::new(
                    ExitCode::RemoveFileErr,
                    format!("removed, but deleting {} failed: {e}", tree.display()),
                )
            })?;
        }
        info!(plugin = name, "plugin removed");
        Ok(0)
    }

    /// Download a candidate package, unpack it into a scratch area, and
    /// run it without touching the registry.
    pub async fn verify(
        &self,
        url: &str,
        params: &str,
        separator: &str,
        params_v2: &str,
    ) -> OpResult {
        let params = split_params(params, separator, params_v2);

        let file_name = url.rsplit('/').next().unwrap_or("package.zip");
        let archive = self.config.plugin_dir.join(file_name);
        std::fs::create_dir_all(&self.config.plugin_dir).map_err(|e| {
            OpError::new(ExitCode::DownloadFail, format!("create plugin dir: {e}"))
        })?;

        if url.starts_with("http://") || url.starts_with("https://") {
            self.catalog
                .download(url, &archive)
                .await
                .map_err(|e| OpError::new(ExitCode::DownloadFail, e.to_string()))?;
        } else {
            // file-protocol source for pre-publication testing
            std::fs::copy(url, &archive).map_err(|e| {
                OpError::new(ExitCode::DownloadFail, format!("copy {url}: {e}"))
            })?;
        }

        let scratch = self.config.plugin_dir.join("verify_plugin_test");
        unzip(&archive, &scratch)?;
        let _ = std::fs::remove_file(&archive);

        let config_path = scratch.join("config.json");
        if !config_path.exists() {
            return Err(OpError::new(
                ExitCode::PluginFormatErr,
                "config.json not found in package",
            ));
        }
        let package = parse_package_config(&config_path)?;
        check_host_match(&package)?;

        let cmd_path = scratch.join(&package.run_path);
        if !cmd_path.exists() {
            return Err(OpError::new(
                ExitCode::PluginFormatErr,
                format!("executable not found: {}", cmd_path.display()),
            ));
        }
        make_executable(&cmd_path)?;

        let env = plugin_env(&scratch, None);
        self.execute_plugin(&cmd_path, &params, package.timeout_secs(), &env, false)
            .await
    }

    // -----------------------------------------------------------------
    // status reporting
    // -----------------------------------------------------------------

    /// Upload one plugin's health, truncating oversized identifiers.
    pub async fn report_status(
        &self,
        name: &str,
        version: &str,
        health: PluginHealth,
    ) -> Result<(), AgentError> {
        let name = truncate(name, PLUGIN_NAME_MAXLEN);
        let version = truncate(version, PLUGIN_VERSION_MAXLEN);
        self.catalog
            .report_status(PluginStatus {
                name,
                version,
                status: health,
            })
            .await
    }

    /// Poll `--status` and push the result upstream.
    pub async fn check_and_report(
        &self,
        name: &str,
        version: &str,
        cmd_path: &Path,
        timeout: u64,
        env: &HashMap<String, String>,
    ) -> (PluginHealth, Result<(), AgentError>) {
        let health = match self
            .execute_plugin(cmd_path, &["--status".into()], timeout, env, true)
            .await
        {
            Ok(0) => PluginHealth::PersistRunning,
            Ok(_) => PluginHealth::PersistFail,
            Err(e) if matches!(e.code, ExitCode::ExecuteFailed | ExitCode::ExecuteTimeout) => {
                PluginHealth::PersistFail
            }
            Err(e) => {
                // Could not even invoke the plugin; nothing to report.
                return (PluginHealth::PersistUnknown, Err(AgentError::Plugin(e.to_string())));
            }
        };
        let report = self.report_status(name, version, health).await;
        (health, report)
    }

    // -----------------------------------------------------------------
    // internals
    // -----------------------------------------------------------------

    fn versioned_dir(&self, name: &str, version: &str) -> PathBuf {
        self.config.plugin_dir.join(name).join(version)
    }

    fn find_local(&self, name: &str, pin_version: &str) -> Result<Option<PluginInfo>, AgentError> {
        let plugins = self.registry.load()?;
        Ok(plugins
            .into_iter()
            .find(|p| {
                p.name == name
                    && !p.is_removed
                    && (pin_version.is_empty() || p.version == pin_version)
            }))
    }

    /// Catalog lookup split into the host-arch match and the list of
    /// other arches the catalog offered.
    async fn find_online(
        &self,
        name: &str,
        pin_version: &str,
    ) -> Result<(Option<PluginInfo>, Vec<String>), AgentError> {
        let list = self
            .catalog
            .query(host_os(), name, pin_version, "")
            .await?;
        let mut matched = None;
        let mut other_arches = Vec::new();
        for plugin in list {
            if plugin.name != name {
                continue;
            }
            if arch_matches(&plugin.arch) {
                matched = Some(plugin);
            } else {
                other_arches.push(plugin.arch.to_lowercase());
            }
        }
        Ok((matched, other_arches))
    }

    /// Spawn the plugin executable and fold the outcome into the exit
    /// taxonomy.
    async fn execute_plugin(
        &self,
        cmd_path: &Path,
        params: &[String],
        timeout: u64,
        env: &HashMap<String, String>,
        quiet: bool,
    ) -> OpResult {
        if !cmd_path.exists() {
            return Err(OpError::new(
                ExitCode::PluginFormatErr,
                format!("executable not found: {}", cmd_path.display()),
            ));
        }
        if self.verbose {
            info!(cmd = %cmd_path.display(), ?params, timeout, "running plugin");
        }

        let mut spec = CommandSpec::new(cmd_path.display().to_string())
            .args(params.iter().cloned())
            .timeout(Duration::from_secs(timeout))
            .quiet(quiet);
        for (key, value) in env {
            spec = spec.env(key.clone(), value.clone());
        }

        let outcome = self
            .runner
            .run(spec)
            .await
            .map_err(|e| OpError::new(ExitCode::ExecuteFailed, e.to_string()))?;
        debug!(
            cmd = %cmd_path.display(),
            exit_code = outcome.exit_code,
            status = ?outcome.status,
            "plugin finished"
        );
        match outcome.status {
            RunStatus::Success => Ok(outcome.exit_code),
            RunStatus::Fail => Err(OpError::new(
                ExitCode::ExecuteFailed,
                format!("plugin exited with code {}", outcome.exit_code),
            )),
            RunStatus::Timeout => Err(OpError::new(
                ExitCode::ExecuteTimeout,
                format!("plugin exceeded {timeout}s timeout"),
            )),
        }
    }
}

// ---------------------------------------------------------------------
// free helpers
// ---------------------------------------------------------------------

fn host_os() -> &'static str {
    std::env::consts::OS
}

/// Catalog arch vocabulary for the current host.
fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    }
}

fn arch_matches(pkg_arch: &str) -> bool {
    let arch = pkg_arch.to_lowercase();
    arch.is_empty() || arch == "all" || arch == host_arch()
}

fn os_matches(pkg_os: &str) -> bool {
    let os = pkg_os.to_lowercase();
    os.is_empty() || os == host_os()
}

fn check_host_match(package: &PluginPackageConfig) -> Result<(), OpError> {
    if !os_matches(&package.os_type) {
        return Err(OpError::new(
            ExitCode::PluginFormatErr,
            format!(
                "package os {} does not match host {}",
                package.os_type,
                host_os()
            ),
        ));
    }
    if !arch_matches(&package.arch) {
        return Err(OpError::new(
            ExitCode::PluginFormatErr,
            format!(
                "package arch {} does not match host {}",
                package.arch,
                host_arch()
            ),
        ));
    }
    Ok(())
}

fn parse_package_config(path: &Path) -> Result<PluginPackageConfig, OpError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        OpError::new(
            ExitCode::PluginFormatErr,
            format!("read {}: {e}", path.display()),
        )
    })?;
    serde_json::from_str(&text).map_err(|e| {
        OpError::new(
            ExitCode::ParseConfigErr,
            format!("parse {}: {e}", path.display()),
        )
    })
}

/// Environment injected into every plugin process.
fn plugin_env(plugin_dir: &Path, pre_plugin_dir: Option<&Path>) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert(
        "PLUGIN_DIR".to_string(),
        plugin_dir.display().to_string(),
    );
    env.insert(
        "PRE_PLUGIN_DIR".to_string(),
        pre_plugin_dir
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
    );
    env
}

/// Split `--params`/`--params-v2` into an argument vector.
fn split_params(params: &str, separator: &str, params_v2: &str) -> Vec<String> {
    if !params_v2.is_empty() {
        return shlex::split(params_v2).unwrap_or_default();
    }
    if params.is_empty() {
        return Vec::new();
    }
    let separator = if separator.is_empty() { "," } else { separator };
    shlex::split(&params.replace(separator, " ")).unwrap_or_default()
}

fn needs_status_refresh(params: &[String]) -> bool {
    params
        .iter()
        .any(|p| NEED_REFRESH_STATUS_PARAMS.contains(&p.as_str()))
}

fn unzip(archive: &Path, dest: &Path) -> Result<(), OpError> {
    std::fs::create_dir_all(dest).map_err(|e| {
        OpError::new(
            ExitCode::UnzipErr,
            format!("create {}: {e}", dest.display()),
        )
    })?;
    let file = std::fs::File::open(archive).map_err(|e| {
        OpError::new(
            ExitCode::UnzipErr,
            format!("open {}: {e}", archive.display()),
        )
    })?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| {
        OpError::new(
            ExitCode::UnzipErr,
            format!("read {}: {e}", archive.display()),
        )
    })?;
    zip.extract(dest).map_err(|e| {
        OpError::new(
            ExitCode::UnzipErr,
            format!("extract {} to {}: {e}", archive.display(), dest.display()),
        )
    })
}

fn compute_md5(path: &Path) -> Result<String, OpError> {
    let bytes = std::fs::read(path).map_err(|e| {
        OpError::new(
            ExitCode::Md5CheckFail,
            format!("read {}: {e}", path.display()),
        )
    })?;
    Ok(format!("{:x}", md5::compute(bytes)))
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<(), OpError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o744)).map_err(|e| {
        OpError::new(
            ExitCode::ExecutablePermissionErr,
            format!("chmod {}: {e}", path.display()),
        )
    })
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<(), OpError> {
    Ok(())
}

fn copy_dir(src: &Path, dst: &Path) -> Result<(), OpError> {
    std::fs::create_dir_all(dst).map_err(|e| {
        OpError::new(
            ExitCode::PluginFormatErr,
            format!("create {}: {e}", dst.display()),
        )
    })?;
    for entry in std::fs::read_dir(src).map_err(|e| {
        OpError::new(
            ExitCode::PluginFormatErr,
            format!("read {}: {e}", src.display()),
        )
    })? {
        let entry = entry.map_err(|e| {
            OpError::new(ExitCode::PluginFormatErr, format!("read entry: {e}"))
        })?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if from.is_dir() {
            copy_dir(&from, &to)?;
        } else {
            std::fs::copy(&from, &to).map_err(|e| {
                OpError::new(
                    ExitCode::PluginFormatErr,
                    format!("copy {}: {e}", from.display()),
                )
            })?;
        }
    }
    Ok(())
}

/// Cap a string at `max` bytes, rounding down to a char boundary so
/// multi-byte names from package metadata never split mid-character.
fn truncate(value: &str, max: usize) -> String {
    if value.len() <= max {
        return value.to_string();
    }
    let mut end = max;
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}

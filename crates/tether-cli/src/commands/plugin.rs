//! Plugin-manager subcommands.
//!
//! Every operation maps onto the closed exit-code taxonomy; the returned
//! code becomes the process exit status.

use std::sync::Arc;

use tracing::error;

use tether_plugin::PluginManager;
use tether_process::SystemRunner;
use tether_types::AgentConfig;

use crate::PluginCommands;

/// Run one plugin subcommand and return the process exit code.
pub async fn run(config: AgentConfig, action: PluginCommands, verbose: bool) -> i32 {
    let manager = match PluginManager::new(config, Arc::new(SystemRunner)) {
        Ok(manager) => manager.with_verbose(verbose),
        Err(e) => {
            error!(error = %e, "plugin manager init failed");
            eprintln!("plugin manager init failed: {e}");
            return 1;
        }
    };

    let result = match action {
        PluginCommands::List { name, local } => manager.list(&name, local).await,
        PluginCommands::Execute {
            file,
            name,
            id,
            params,
            separator,
            params_v2,
            version,
            local,
        } => {
            if !id.is_empty() {
                tracing::info!(plugin_id = %id, "executing by plugin id");
            }
            manager
                .execute(&file, &name, &params, &separator, &params_v2, &version, local)
                .await
        }
        PluginCommands::Remove { name } => manager.remove(&name).await,
        PluginCommands::Verify {
            url,
            params,
            separator,
            params_v2,
        } => manager.verify(&url, &params, &separator, &params_v2).await,
        PluginCommands::Status => manager.show_status().await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{e}");
            e.code.code()
        }
    }
}

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tether_types::AgentConfig;

/// Tether -- on-host agent connecting fleet instances to the control plane.
#[derive(Parser, Debug)]
#[command(name = "tether", version, about)]
struct Cli {
    /// Increase logging verbosity (RUST_LOG=debug)
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Suppress all output except errors
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Path to the agent config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the agent: control channels, task engine, coldstart fetch
    Daemon,

    /// Plugin-manager subcommands
    Plugin {
        #[command(subcommand)]
        action: PluginCommands,
    },

    /// Open an interactive session against a session endpoint
    Session {
        /// Web-socket URL of the session endpoint
        url: String,

        /// Session token
        #[arg(long)]
        token: String,

        /// Treat the stream as an opaque port-forward instead of a shell
        #[arg(long)]
        port_forward: bool,
    },
}

#[derive(Subcommand, Debug)]
enum PluginCommands {
    /// List installed (or online) plugins
    List {
        /// Filter by plugin name
        #[arg(long, default_value = "")]
        name: String,

        /// Only consult the local registry
        #[arg(long)]
        local: bool,
    },

    /// Install (if needed) and execute a plugin
    Execute {
        /// Path to a local plugin package (.zip)
        #[arg(long, default_value = "")]
        file: String,

        /// Plugin name for online-or-local execution
        #[arg(long, default_value = "")]
        name: String,

        /// Plugin id (informational)
        #[arg(long, default_value = "")]
        id: String,

        /// Separator-joined parameter list
        #[arg(long, default_value = "")]
        params: String,

        /// Separator used inside --params (default ",")
        #[arg(long, default_value = "")]
        separator: String,

        /// Shell-quoted parameter string; overrides --params
        #[arg(long = "paramsV2", default_value = "")]
        params_v2: String,

        /// Pin a plugin version
        #[arg(long, default_value = "")]
        version: String,

        /// Never consult the online catalog
        #[arg(long)]
        local: bool,
    },

    /// Remove an installed plugin
    Remove {
        #[arg(long)]
        name: String,
    },

    /// Download a candidate package and run it without installing
    Verify {
        #[arg(long)]
        url: String,

        #[arg(long, default_value = "")]
        params: String,

        #[arg(long, default_value = "")]
        separator: String,

        #[arg(long = "paramsV2", default_value = "")]
        params_v2: String,
    },

    /// Poll and print the status of installed persist plugins
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = AgentConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Daemon => commands::daemon::run(config).await,
        Commands::Plugin { action } => {
            let code = commands::plugin::run(config, action, cli.verbose).await;
            std::process::exit(code);
        }
        Commands::Session {
            url,
            token,
            port_forward,
        } => commands::session::run(url, token, port_forward).await,
    }
}

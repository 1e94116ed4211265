//! MD Reader Pro CLI - load and talk to plugins from a terminal.

mod commands;
mod ui;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "mdreader")]
#[command(about = "MD Reader Pro - plugin host")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Loader config file (default: ~/.mdreader/plugins.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory to scan for plugin manifests
    #[arg(long, global = true)]
    plugins_dir: Option<PathBuf>,

    /// Answer from the built-in simulator instead of spawning plugins
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Plugin operations
    Plugins {
        #[command(subcommand)]
        action: PluginCommands,
    },
}

#[derive(Subcommand)]
enum PluginCommands {
    /// List available plugins
    List,

    /// Load a plugin and call one action
    Call {
        /// Plugin ID
        id: String,

        /// Action name
        action: String,

        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,

        /// Request timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Load a plugin and measure a ping round trip
    Ping {
        /// Plugin ID
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    let Some(command) = cli.command else {
        ui::info("Run 'mdreader plugins list' to see available plugins, or 'mdreader --help' for all commands.");
        return Ok(());
    };

    match command {
        Commands::Plugins { action } => {
            let action = match action {
                PluginCommands::List => commands::plugins::PluginsAction::List,
                PluginCommands::Call {
                    id,
                    action,
                    payload,
                    timeout_ms,
                } => commands::plugins::PluginsAction::Call {
                    id,
                    action,
                    payload,
                    timeout_ms,
                },
                PluginCommands::Ping { id } => commands::plugins::PluginsAction::Ping { id },
            };
            let args = commands::plugins::PluginsArgs {
                action,
                config: cli.config,
                plugins_dir: cli.plugins_dir,
                simulate: cli.simulate,
            };
            commands::run_plugins(args).await?;
        }
    }

    Ok(())
}

//! Meshgate CLI
//!
//! ```bash
//! meshgate --config mesh.toml gateway          # registry + router node
//! meshgate worker --name search --id w-1 --port 7000
//! meshgate --config mesh.toml config show
//! ```
//!
//! Settings come from the config file, then `MESHGATE_*` environment variables.

mod args;
mod commands;
mod logging;

use anyhow::Result;
use clap::Parser;
use meshgate_core::MeshConfig;

use args::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = MeshConfig::load(cli.config.as_deref())?;

    logging::init(&config.logging, cli.verbose);
    tracing::debug!(config = ?cli.config, transport = ?config.bus.transport, "Configuration loaded");

    match cli.command {
        Commands::Gateway { report_interval } => {
            commands::gateway::execute(&config, report_interval).await
        }
        Commands::Worker(args) => commands::worker::execute(&config, args).await,
        Commands::Config { action } => commands::config::execute(&config, action),
    }
}

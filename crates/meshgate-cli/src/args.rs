//! CLI argument definitions using clap
//!
//! - meshgate gateway             # Registry + router node
//! - meshgate worker --name ...   # Membership agent for one backend
//! - meshgate config show         # Effective configuration

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "meshgate")]
#[command(about = "Meshgate - service registry, load balancer and circuit-breaking router")]
#[command(version)]
pub struct Cli {
    /// Path to configuration file (TOML, YAML or JSON)
    #[arg(long, short, global = true, env = "MESHGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging unless RUST_LOG is set
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a gateway node: registry, health probes and router
    Gateway {
        /// How often to log a service snapshot
        #[arg(long, default_value = "30s", value_parser = parse_duration)]
        report_interval: Duration,
    },

    /// Run a worker agent that registers and heartbeats until Ctrl-C
    Worker(WorkerArgs),

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args, Clone, Debug)]
pub struct WorkerArgs {
    /// Logical service name
    #[arg(long)]
    pub name: String,

    /// Instance id, unique within the service
    #[arg(long)]
    pub id: String,

    /// Address the gateway should forward to
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long)]
    pub port: u16,

    /// Advertised endpoint paths (repeatable)
    #[arg(long = "endpoint")]
    pub endpoints: Vec<String>,

    /// Advertised version, defaults to this binary's version
    #[arg(long)]
    pub version: Option<String>,
}

#[derive(Subcommand, Clone, Copy)]
pub enum ConfigAction {
    /// Print the effective configuration after file and environment overrides
    Show {
        /// Output as TOML instead of JSON
        #[arg(long)]
        toml: bool,
    },

    /// Validate the configuration and exit
    Validate,
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(value).map_err(|e| e.to_string())
}

//! fleetd: the fleet daemon.
//!
//! Single binary that assembles the fleet subsystems:
//! - State store (redb)
//! - Message bus
//! - Autoscaler
//! - Deployment queue and deploy-command subscriber
//! - Heartbeat listener
//! - Orphan reaper
//!
//! # Usage
//!
//! ```text
//! fleetd standalone --config /etc/fleet/fleet.toml
//! fleetd check-config --config /etc/fleet/fleet.toml
//! ```

mod standalone;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use fleet_core::{DEFAULT_CONFIG_PATH, FleetConfig};
use tracing::info;

#[derive(Parser)]
#[command(name = "fleetd", about = "Fleet daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every loop in one process against one node.
    Standalone {
        /// Path to fleet.toml.
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
    /// Load and validate the configuration, then print it.
    CheckConfig {
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,fleetd=debug,fleet=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Standalone { config } => {
            let config = load(&config)?;
            standalone::run(config).await
        }
        Command::CheckConfig { config } => {
            let loaded = load(&config)?;
            info!(path = %config.display(), "configuration is valid");
            print!("{}", loaded.to_toml_string()?);
            Ok(())
        }
    }
}

fn load(path: &Path) -> anyhow::Result<FleetConfig> {
    let config = FleetConfig::from_file(path)
        .with_context(|| format!("loading {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("validating {}", path.display()))?;
    Ok(config)
}

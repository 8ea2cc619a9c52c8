mod run;
mod status;

pub use run::RunCommand;
pub use status::StatusCommand;

use anyhow::Result;
use beacon::BeaconConfig;
use clap::{Parser, Subcommand};

/// BEACON - cluster topology discovery and job redistribution
#[derive(Parser)]
#[command(name = "beacon")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// CLI commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Run a beacon instance.
    Run(RunCommand),

    /// Show the instances and the established view recorded in the store.
    Status(StatusCommand),
}

impl Cli {
    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run(cmd) => cmd.execute().await,
            Commands::Status(cmd) => cmd.execute().await,
        }
    }
}

/// Load a configuration file, failing with a hint when it is missing.
fn load_config(path: &str) -> Result<BeaconConfig> {
    if !std::path::Path::new(path).exists() {
        anyhow::bail!(
            "Configuration file not found: {}\nPass --config with the path to a beacon.toml.",
            path
        );
    }
    Ok(BeaconConfig::from_file(path)?)
}

use anyhow::Result;
use beacon::{init_logging, Beacon};
use clap::Parser;
use console::style;
use tracing::info;

use super::load_config;

/// Run a beacon instance.
#[derive(Parser)]
pub struct RunCommand {
    /// Configuration file path.
    #[arg(short, long, default_value = "beacon.toml")]
    pub config: String,

    /// Address of the inbound connector endpoint (overrides config).
    #[arg(short, long)]
    pub listen: Option<String>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long)]
    pub verbose: bool,
}

impl RunCommand {
    /// Execute the run command.
    pub async fn execute(self) -> Result<()> {
        dotenvy::dotenv().ok();

        let mut config = load_config(&self.config)?;
        if self.verbose {
            config.logging.level = "debug".to_string();
        }
        init_logging(&config.logging);

        println!();
        println!(
            "  {}  {} v{}",
            style("◉").bold(),
            style("BEACON").bold().cyan(),
            env!("CARGO_PKG_VERSION")
        );
        println!();

        info!("Loaded configuration from {}", self.config);

        let mut builder = Beacon::builder().config(config);
        if let Some(listen) = self.listen {
            builder = builder.listen(listen);
        }
        let beacon = builder.build()?;

        match beacon.listen_addr() {
            Some(addr) => println!(
                "  {} Connector endpoint on {}",
                style("→").bold(),
                style(format!("http://{}", addr)).cyan()
            ),
            None => println!("  {} No inbound connector endpoint", style("→").bold()),
        }
        for url in &beacon.config().connector.urls {
            println!("  {} Announcing to {}", style("↗").bold(), style(url).cyan());
        }
        println!();

        beacon.run().await?;
        Ok(())
    }
}

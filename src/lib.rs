pub mod backends;
pub mod config;
pub mod error;
pub mod event;
pub mod load_config;
pub mod locator;
pub mod message;
pub mod pipeline;
pub mod publisher;
pub mod secrets;
pub mod source;
pub mod transform;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use load_config::load_config;
use pipeline::run_watcher;
use publisher::HttpPublisher;

#[derive(Parser)]
#[clap(
    name = "object-watcher",
    version,
    about = "Watch storage backends for new objects and publish one message per object"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a watcher described by the given config file until interrupted
    Watch {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
    },
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Watch { config } => {
            let config = load_config(config)?;
            let publisher = HttpPublisher::from_config(&config.publisher)?;

            let shutdown = CancellationToken::new();
            let signal_token = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    signal_token.cancel();
                }
            });

            println!("Watcher starting...");
            match run_watcher(&config, &publisher, shutdown).await {
                Ok(report) => {
                    println!("Watcher stopped.\nReport:");
                    println!("{report:#?}");
                    Ok(())
                }
                Err(e) => {
                    eprintln!("[ERROR] Watcher failed: {e}");
                    Err(anyhow::Error::msg(e))
                }
            }
        }
    }
}

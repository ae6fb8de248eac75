//! # ferry
//!
//! Command-line front end of the flow pipeline.
//!
//! `ferry run` loads the engine configuration (defaults, then `--config`,
//! then `FERRY_*` variables), starts the partitioned worker pool with the
//! built-in flows and streams a JSON-lines file of inbound events through it.
//! Committed outbound records are printed to stdout, one enveloped record
//! per line. Logs go to stderr and follow `RUST_LOG`.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![deny(clippy::expect_used)]

mod cli;
mod config;
mod driver;
mod flows;

use std::fs::File;
use std::io::{self, BufReader};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { events, config } => {
            let config = config::load_config(config.as_deref())
                .context("failed to load configuration")?;
            let input = File::open(&events)
                .with_context(|| format!("failed to open {}", events.display()))?;
            let summary = driver::run(&config, BufReader::new(input), io::stdout().lock()).await?;
            info!(?summary, "Done");
            if summary.failed > 0 {
                anyhow::bail!("{} event(s) failed to process", summary.failed);
            }
        }
        Commands::Flows => {
            let registry = flows::builtin_registry();
            for name in registry.names() {
                println!("{name}");
            }
        }
        Commands::Config { config } => {
            let config = config::load_config(config.as_deref())
                .context("failed to load configuration")?;
            let rendered =
                toml::to_string_pretty(&config).context("failed to render configuration")?;
            print!("{rendered}");
        }
    }
    Ok(())
}

/// Initialize tracing on stderr, filtered by `RUST_LOG` (default `info`).
fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

//! CLI command definitions using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// ferry - checkpointed flow orchestration
#[derive(Parser, Debug)]
#[command(name = "ferry")]
#[command(version)]
#[command(about = "Drive suspendable flows from a stream of session and service events")]
#[command(
    long_about = "ferry replays enveloped inbound events through the flow pipeline, committing \
                  checkpoints and printing the outbound records each event produces."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Process a JSON-lines file of inbound events
    Run {
        /// File with one enveloped inbound event per line
        #[arg(short, long)]
        events: PathBuf,

        /// TOML engine configuration
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// List the built-in flows
    Flows,

    /// Print the effective configuration as TOML
    Config {
        /// TOML engine configuration
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_requires_events() {
        assert!(Cli::try_parse_from(["ferry", "run"]).is_err());
    }

    #[test]
    fn test_flows_takes_no_arguments() {
        assert!(matches!(
            Cli::try_parse_from(["ferry", "flows"]).map(|c| c.command),
            Ok(Commands::Flows)
        ));
        assert!(Cli::try_parse_from(["ferry", "flows", "--events", "x"]).is_err());
    }

    #[test]
    fn test_run_parses_paths() {
        let cli = Cli::try_parse_from(["ferry", "run", "--events", "in.jsonl", "-c", "ferry.toml"]);
        match cli.map(|c| c.command) {
            Ok(Commands::Run { events, config }) => {
                assert_eq!(events, PathBuf::from("in.jsonl"));
                assert_eq!(config, Some(PathBuf::from("ferry.toml")));
            }
            other => unreachable!("unexpected parse: {other:?}"),
        }
    }
}

//! sinkbridge - unified CLI entrypoint.
//!
//! Usage:
//!   sinkbridge validate --config config/sinkbridge.toml
//!   sinkbridge replay --config config/sinkbridge.toml --input records.jsonl

use anyhow::Result;
use clap::Parser;
use sinkbridge::cli::commands::{run_replay, run_validate};
use sinkbridge::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate(args) => run_validate(args),
        Commands::Replay(args) => run_replay(args).await,
    }
}

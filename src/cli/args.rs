//! CLI argument definitions using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// sinkbridge - deliver streaming-log records to a queue/topic broker.
#[derive(Parser)]
#[command(name = "sinkbridge")]
#[command(version)]
#[command(about = "At-least-once delivery from a streaming log to a message broker")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a configuration file and print the resolved settings
    Validate(ValidateArgs),

    /// Replay JSON-lines records through a sink task bound to the in-process broker
    Replay(ReplayArgs),
}

/// Output format for command reports.
#[derive(clap::ValueEnum, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text
    #[default]
    Text,
    /// JSON objects, one per line
    Json,
}

// -----------------------------------------------------------------------------
// Validate command
// -----------------------------------------------------------------------------

#[derive(Args)]
pub struct ValidateArgs {
    /// Path to configuration file (TOML, or JSON by extension)
    #[arg(short, long, default_value = "config/sinkbridge.toml")]
    pub config: PathBuf,

    /// Output format
    #[arg(long, value_enum, default_value = "text")]
    pub format: OutputFormat,
}

// -----------------------------------------------------------------------------
// Replay command
// -----------------------------------------------------------------------------

#[derive(Args)]
pub struct ReplayArgs {
    /// Path to configuration file (TOML, or JSON by extension)
    #[arg(short, long, default_value = "config/sinkbridge.toml")]
    pub config: PathBuf,

    /// JSON-lines file with one record per line
    #[arg(short, long, value_name = "PATH")]
    pub input: PathBuf,

    /// Records per submitted batch
    #[arg(long, default_value_t = 100)]
    pub batch_size: usize,

    /// Redeliveries of a batch that was not committed before giving up
    #[arg(long, default_value_t = 3)]
    pub max_redeliveries: u32,

    /// Bind address for the telemetry endpoint (overrides telemetry.metrics_bind)
    #[arg(long)]
    pub metrics_bind: Option<String>,

    /// Output format for per-batch reports
    #[arg(long, value_enum, default_value = "json")]
    pub format: OutputFormat,
}

//! sinkbridge CLI.
//!
//! Provides a single binary entry point for:
//! - `sinkbridge validate` - Check a configuration and print the resolved settings
//! - `sinkbridge replay` - Push JSON-lines records through a sink task on the in-process broker

mod args;
pub mod commands;

pub use args::{Cli, Commands, OutputFormat, ReplayArgs, ValidateArgs};

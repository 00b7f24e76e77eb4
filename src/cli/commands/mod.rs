//! CLI command implementations.

mod replay;
mod validate;

pub use replay::{read_records, run_replay};
pub use validate::{run_validate, summarize, ConfigSummary, DestinationSummary};

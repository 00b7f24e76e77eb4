//! Core task infrastructure.
//!
//! - `config` - Configuration parsing and validation
//! - `runtime` - Sink task orchestration and shutdown

pub mod config;
pub mod runtime;

pub use config::*;
pub use runtime::*;

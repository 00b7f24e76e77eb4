#![deny(unused, dead_code)]
#![deny(clippy::all, clippy::pedantic)]
// Module naming: common pattern in domain-driven code
#![allow(clippy::module_name_repetitions)]
// Function complexity: some functions are inherently complex
#![allow(clippy::too_many_lines)]
#![allow(clippy::too_many_arguments)]
// Variable naming: domain terms often similar
#![allow(clippy::similar_names)]
// Documentation style: many terms don't need backticks
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
// API ergonomics: prefer simplicity over must_use annotations
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
// Format strings: allow non-inlined for readability
#![allow(clippy::uninlined_format_args)]
// Struct field patterns
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::struct_field_names)]
// Numeric casts: counters and window sizes
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::cast_possible_wrap)]
// Control flow style
#![allow(clippy::if_not_else)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::single_match_else)]
#![allow(clippy::manual_let_else)]
// Passing style
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::trivially_copy_pass_by_ref)]
// Self usage
#![allow(clippy::unused_self)]
// Option/Result patterns
#![allow(clippy::unnecessary_wraps)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::map_unwrap_or)]
// Type defaults
#![allow(clippy::default_trait_access)]
#![allow(clippy::implicit_hasher)]
// Closure style
#![allow(clippy::redundant_closure_for_method_calls)]
// Large types
#![allow(clippy::large_futures)]
#![allow(clippy::large_enum_variant)]
#![allow(clippy::significant_drop_tightening)]
// Error handling style
#![allow(clippy::result_large_err)]
// Explicit returns
#![allow(clippy::semicolon_if_nothing_returned)]
// Iteration style
#![allow(clippy::explicit_iter_loop)]
// Async functions that may not await yet
#![allow(clippy::unused_async)]

//! sinkbridge - at-least-once delivery from a partitioned streaming log to a
//! queue/topic message broker.
//!
//! # Module Organization
//!
//! ## Core
//! - `core::config` - Configuration parsing and validation
//! - `core::runtime` - Sink task: batch submission, offsets, shutdown
//!
//! ## Delivery
//! - `delivery::message` - Records, outbound messages, correlation ids
//! - `delivery::translator` - Record to message translation
//! - `delivery::coordinator` - Publish cycles, commit and resubmission
//!
//! ## Messaging
//! - `messaging::acks` - Acknowledgment tracking and the publisher window
//! - `messaging::flow` - Window accounting and the low-water mark
//! - `messaging::transactions` - Transaction staging and autoflush
//!
//! ## Session
//! - `session::connection` - Connection manager, host failover, reconnect
//! - `session::keepalive` - Keep-alive monitor
//! - `session::properties` - Session properties from configuration
//! - `session::memory` - In-process broker
//!
//! ## Policy
//! - `policy` - Error classification and dispositions
//!
//! ## Operations
//! - `ops::observability` - Delivery metrics
//! - `ops::events` - Operator events
//! - `ops::telemetry` - Logging and the telemetry endpoint

// Core infrastructure
pub mod core;

// Delivery pipeline
pub mod delivery;
pub mod messaging;
pub mod policy;

// Broker sessions
pub mod session;

// Operations
pub mod ops;

// CLI
pub mod cli;

pub use self::core::{config, runtime};
pub use self::core::{Config, Outcome, ShutdownHandle, SinkTask};
pub use delivery::{CycleReport, Destination, DestinationKind, SinkRecord};
pub use ops::{events, observability, telemetry};
pub use policy::{Disposition, ErrorPolicy, NackReason, SinkError};
pub use session::{BrokerSession, MemoryBroker, SessionError, SessionFactory, SessionState};

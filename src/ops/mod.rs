//! Operations and observability.
//!
//! - `observability` - Delivery counters and Prometheus rendering
//! - `events` - Operator event sink for fatal failures and ignored drops
//! - `telemetry` - Logging setup and the HTTP telemetry endpoint

pub mod events;
pub mod observability;
pub mod telemetry;

pub use events::*;
pub use observability::*;
pub use telemetry::*;

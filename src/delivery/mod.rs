//! Record delivery.
//!
//! - `message` - Records, destinations and outbound messages
//! - `translator` - Record-to-message translation capability
//! - `coordinator` - Publish cycle execution

pub mod coordinator;
pub mod message;
pub mod translator;

pub use coordinator::*;
pub use message::*;
pub use translator::*;

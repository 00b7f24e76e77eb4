//! Publisher-side message handling.
//!
//! - `acks` - Acknowledgment tracking and the delivery-event channel
//! - `flow` - Publisher window and low-water-mark
//! - `transactions` - Transacted publish buffering with autoflush

pub mod acks;
pub mod flow;
pub mod transactions;

pub use acks::*;
pub use flow::*;
pub use transactions::*;

//! Publisher flow control.
//!
//! The broker grants the publisher a fixed window of unacknowledged messages.
//! `PublisherWindow` counts what is outstanding against that grant and
//! `LowWaterMark` remembers how far every registered message has been resolved.

use crate::delivery::message::CorrelationId;

/// Outstanding-message budget negotiated with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublisherWindow {
    capacity: Option<usize>,
    in_flight: usize,
}

impl PublisherWindow {
    /// Window that admits at most `capacity` unacknowledged messages.
    pub fn bounded(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity.max(1)),
            in_flight: 0,
        }
    }

    /// Window without a cap, for per-message acknowledgment.
    pub fn unbounded() -> Self {
        Self {
            capacity: None,
            in_flight: 0,
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn has_room(&self) -> bool {
        match self.capacity {
            Some(cap) => self.in_flight < cap,
            None => true,
        }
    }

    pub fn acquire(&mut self) {
        self.in_flight += 1;
    }

    pub fn release(&mut self, count: usize) {
        self.in_flight = self.in_flight.saturating_sub(count);
    }

    pub fn reset(&mut self) {
        self.in_flight = 0;
    }
}

/// Highest correlation id below which nothing is unresolved. Never moves back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LowWaterMark(Option<CorrelationId>);

impl LowWaterMark {
    pub fn get(&self) -> Option<CorrelationId> {
        self.0
    }

    /// Raise the mark to `candidate` if it is higher; returns whether it moved.
    pub fn advance(&mut self, candidate: CorrelationId) -> bool {
        match self.0 {
            Some(current) if current >= candidate => false,
            _ => {
                self.0 = Some(candidate);
                true
            }
        }
    }
}

//! Acknowledgment tracking for broker delivery confirmation.
//!
//! The tracker has a single owner (the coordinator). Broker sessions never touch
//! it directly: they report delivery events through a cloneable [`AckHandle`],
//! which forwards them over a channel the owner drains while it waits.

use crate::core::config::AckEventMode;
use crate::delivery::message::{AckRecord, AckState, CorrelationId};
use crate::messaging::flow::{LowWaterMark, PublisherWindow};
use crate::policy::NackReason;
use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Delivery Events
// ---------------------------------------------------------------------------

/// Confirmation reported by a broker session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryEvent {
    Acked(CorrelationId),
    /// Windowed confirmation of every pending id up to and including this one.
    AckedUpTo(CorrelationId),
    Nacked(CorrelationId, NackReason),
}

/// Sending side of the tracker's event channel, handed to broker sessions.
#[derive(Debug, Clone)]
pub struct AckHandle {
    tx: mpsc::UnboundedSender<DeliveryEvent>,
}

impl AckHandle {
    pub fn on_ack(&self, id: CorrelationId) {
        self.send(DeliveryEvent::Acked(id));
    }

    pub fn on_ack_up_to(&self, id: CorrelationId) {
        self.send(DeliveryEvent::AckedUpTo(id));
    }

    pub fn on_nack(&self, id: CorrelationId, reason: NackReason) {
        self.send(DeliveryEvent::Nacked(id, reason));
    }

    fn send(&self, event: DeliveryEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("ack tracker dropped; discarding delivery event");
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// How waiting for outstanding acknowledgments ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// No registered message is pending.
    Resolved,
    /// A message was rejected; returned as soon as it is seen.
    Nacked { id: CorrelationId, reason: NackReason },
    TimedOut(Duration),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AckError {
    #[error("publisher window of {window} stayed full for {waited:?}")]
    WindowTimeout { window: usize, waited: Duration },
    #[error("acknowledgment tracking cancelled by shutdown")]
    Cancelled,
    #[error("correlation id {0} is already registered")]
    Duplicate(CorrelationId),
}

enum Wake {
    Event(Option<DeliveryEvent>),
    Deadline,
    Shutdown { closed: bool },
}

// ---------------------------------------------------------------------------
// Acknowledgment Tracker
// ---------------------------------------------------------------------------

/// Correlates submitted messages with broker acknowledgments.
#[derive(Debug)]
pub struct AckTracker {
    mode: AckEventMode,
    window: PublisherWindow,
    records: BTreeMap<CorrelationId, AckRecord>,
    nacks: VecDeque<(CorrelationId, NackReason)>,
    low_water: LowWaterMark,
    events: mpsc::UnboundedReceiver<DeliveryEvent>,
    handle: AckHandle,
}

impl AckTracker {
    pub fn new(mode: AckEventMode, window_size: usize) -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        let window = match mode {
            AckEventMode::Windowed => PublisherWindow::bounded(window_size),
            AckEventMode::PerMessage => PublisherWindow::unbounded(),
        };
        Self {
            mode,
            window,
            records: BTreeMap::new(),
            nacks: VecDeque::new(),
            low_water: LowWaterMark::default(),
            events,
            handle: AckHandle { tx },
        }
    }

    pub fn handle(&self) -> AckHandle {
        self.handle.clone()
    }

    pub fn mode(&self) -> AckEventMode {
        self.mode
    }

    pub fn in_flight(&self) -> usize {
        self.window.in_flight()
    }

    pub fn low_water_mark(&self) -> Option<CorrelationId> {
        self.low_water.get()
    }

    pub fn state(&self, id: CorrelationId) -> Option<&AckState> {
        self.records.get(&id).map(|r| &r.state)
    }

    /// Ids registered and still waiting for the broker, in ascending order.
    pub fn pending(&self) -> Vec<CorrelationId> {
        self.records
            .values()
            .filter(|r| r.is_pending())
            .map(|r| r.correlation_id)
            .collect()
    }

    /// Register `id` as pending before it is submitted.
    ///
    /// In windowed mode this waits while the publisher window is full, applying
    /// delivery events as they arrive, for at most `timeout`.
    pub async fn register(
        &mut self,
        id: CorrelationId,
        timeout: Duration,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), AckError> {
        self.drain();
        if self.records.contains_key(&id) {
            return Err(AckError::Duplicate(id));
        }
        let deadline = Instant::now() + timeout;
        while !self.window.has_room() {
            if *shutdown.borrow() {
                return Err(AckError::Cancelled);
            }
            match self.wait(deadline, shutdown).await {
                Wake::Event(Some(event)) => self.apply(event),
                Wake::Event(None) => return Err(AckError::Cancelled),
                Wake::Deadline => {
                    return Err(AckError::WindowTimeout {
                        window: self.window.capacity().unwrap_or(0),
                        waited: timeout,
                    })
                }
                Wake::Shutdown { closed } => {
                    if closed || *shutdown.borrow() {
                        return Err(AckError::Cancelled);
                    }
                }
            }
        }
        self.records.insert(id, AckRecord::pending(id));
        self.window.acquire();
        Ok(())
    }

    /// Resolve `id` locally, for messages confirmed without a broker ack.
    pub fn mark_acked(&mut self, id: CorrelationId) {
        self.resolve(id, AckState::Acked);
        self.advance_low_water();
    }

    /// Wait until every registered message is resolved. The first nack is
    /// returned as soon as it arrives; call again to keep waiting.
    pub async fn await_resolution(
        &mut self,
        timeout: Duration,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Resolution {
        let deadline = Instant::now() + timeout;
        loop {
            self.drain();
            if let Some((id, reason)) = self.nacks.pop_front() {
                return Resolution::Nacked { id, reason };
            }
            if self.window.in_flight() == 0 {
                return Resolution::Resolved;
            }
            if *shutdown.borrow() {
                return Resolution::Cancelled;
            }
            match self.wait(deadline, shutdown).await {
                Wake::Event(Some(event)) => self.apply(event),
                Wake::Event(None) => return Resolution::Cancelled,
                Wake::Deadline => return Resolution::TimedOut(timeout),
                Wake::Shutdown { closed } => {
                    if closed || *shutdown.borrow() {
                        return Resolution::Cancelled;
                    }
                }
            }
        }
    }

    /// Nacks received but not yet returned by [`await_resolution`](Self::await_resolution).
    pub fn take_nacks(&mut self) -> Vec<(CorrelationId, NackReason)> {
        self.drain();
        self.nacks.drain(..).collect()
    }

    /// Stop tracking every registered id; late events for them are ignored.
    pub fn retire_all(&mut self) {
        self.drain();
        self.records.clear();
        self.nacks.clear();
        self.window.reset();
    }

    fn drain(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.apply(event);
        }
    }

    async fn wait(&mut self, deadline: Instant, shutdown: &mut watch::Receiver<bool>) -> Wake {
        tokio::select! {
            event = self.events.recv() => Wake::Event(event),
            _ = tokio::time::sleep_until(deadline) => Wake::Deadline,
            changed = shutdown.changed() => Wake::Shutdown { closed: changed.is_err() },
        }
    }

    fn apply(&mut self, event: DeliveryEvent) {
        match event {
            DeliveryEvent::Acked(id) => {
                self.resolve(id, AckState::Acked);
            }
            DeliveryEvent::AckedUpTo(id) => {
                let covered: Vec<CorrelationId> = match self.low_water.get() {
                    Some(mark) if mark >= id => Vec::new(),
                    _ => self
                        .records
                        .range((self.above_low_water(), Bound::Included(id)))
                        .filter(|(_, r)| r.is_pending())
                        .map(|(k, _)| *k)
                        .collect(),
                };
                for covered_id in covered {
                    self.resolve(covered_id, AckState::Acked);
                }
            }
            DeliveryEvent::Nacked(id, reason) => {
                if self.resolve(id, AckState::Nacked(reason.clone())) {
                    self.nacks.push_back((id, reason));
                }
            }
        }
        self.advance_low_water();
    }

    fn resolve(&mut self, id: CorrelationId, state: AckState) -> bool {
        match self.records.get_mut(&id) {
            Some(record) if record.is_pending() => {
                record.state = state;
                self.window.release(1);
                true
            }
            Some(_) => false,
            None => {
                tracing::trace!(correlation_id = %id, "ignoring event for unknown id");
                false
            }
        }
    }

    /// Everything at or below the mark is already resolved.
    fn above_low_water(&self) -> Bound<CorrelationId> {
        self.low_water.get().map_or(Bound::Unbounded, Bound::Excluded)
    }

    fn advance_low_water(&mut self) {
        let mut candidate = None;
        let unsettled = self.records.range((self.above_low_water(), Bound::Unbounded));
        for (id, record) in unsettled {
            if record.is_pending() {
                break;
            }
            candidate = Some(*id);
        }
        if let Some(id) = candidate {
            self.low_water.advance(id);
        }
    }
}

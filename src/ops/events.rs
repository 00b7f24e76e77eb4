use crate::session::SessionState;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::event;

/// Operator-visible occurrence: every fatal failure and every ignorable drop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Fatal {
        kind: &'static str,
        message: String,
    },
    IgnoredNack {
        correlation_id: u64,
        destination: String,
        reason: String,
    },
    DiscardedRecord {
        record: String,
        reason: String,
    },
    StateChanged {
        from: SessionState,
        to: SessionState,
        host: Option<String>,
    },
}

impl SinkEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            SinkEvent::Fatal { .. } => "fatal",
            SinkEvent::IgnoredNack { .. } => "ignored_nack",
            SinkEvent::DiscardedRecord { .. } => "discarded_record",
            SinkEvent::StateChanged { .. } => "state_changed",
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: SinkEvent);
}

/// Default sink: one structured log line per event under target `sink_event`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, sink_event: SinkEvent) {
        let event_type = sink_event.event_type();
        match &sink_event {
            SinkEvent::Fatal { kind, message } => {
                event!(target: "sink_event", tracing::Level::ERROR, %event_type, %kind, %message);
            }
            SinkEvent::IgnoredNack {
                correlation_id,
                destination,
                reason,
            } => {
                event!(
                    target: "sink_event",
                    tracing::Level::WARN,
                    %event_type,
                    correlation_id,
                    %destination,
                    %reason
                );
            }
            SinkEvent::DiscardedRecord { record, reason } => {
                event!(target: "sink_event", tracing::Level::WARN, %event_type, %record, %reason);
            }
            SinkEvent::StateChanged { from, to, host } => {
                event!(
                    target: "sink_event",
                    tracing::Level::INFO,
                    %event_type,
                    from = from.as_str(),
                    to = to.as_str(),
                    host = host.as_deref().unwrap_or("-")
                );
            }
        }
    }
}

/// Keeps every event in memory; forwards to an inner sink when one is set.
#[derive(Clone, Default)]
pub struct RecordingEventSink {
    inner: Arc<Mutex<Vec<SinkEvent>>>,
    forward: Option<Arc<dyn EventSink>>,
}

impl RecordingEventSink {
    pub fn forwarding(forward: Arc<dyn EventSink>) -> Self {
        Self {
            inner: Arc::default(),
            forward: Some(forward),
        }
    }

    pub fn snapshot(&self) -> Vec<SinkEvent> {
        self.inner.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count(&self, event_type: &str) -> usize {
        self.inner
            .lock()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .count()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: SinkEvent) {
        if let Some(forward) = &self.forward {
            forward.emit(event.clone());
        }
        self.inner.lock().push(event);
    }
}

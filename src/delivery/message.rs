//! Records in, messages out.
//!
//! `SinkRecord` is what the upstream log hands over for one offset.
//! `OutboundMessage` is what actually travels to the broker, wrapped by the
//! coordinator around whatever the translator produced.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

/// Kind of broker endpoint a message is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationKind {
    Queue,
    Topic,
}

impl DestinationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DestinationKind::Queue => "queue",
            DestinationKind::Topic => "topic",
        }
    }
}

/// Named broker endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    pub name: String,
    pub kind: DestinationKind,
}

impl Destination {
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DestinationKind::Queue,
        }
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DestinationKind::Topic,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.name)
    }
}

/// Broker delivery guarantee for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Spooled by the broker and confirmed with an acknowledgment.
    Persistent,
    /// Fire-and-forget; confirmed by successful hand-off to the session.
    Direct,
}

/// Opaque token correlating a submitted message with its acknowledgment.
///
/// Ids are allocated from a counter that only grows, so they are unique across
/// cycles and across resubmissions of the same message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(pub u64);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One record consumed from the upstream log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<(String, Bytes)>,
    pub timestamp: Option<i64>,
}

impl SinkRecord {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            value: None,
            headers: Vec::new(),
            timestamp: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// `topic-partition@offset`, used as the record identity in events and logs.
    pub fn identity(&self) -> String {
        format!("{}-{}@{}", self.topic, self.partition, self.offset)
    }
}

/// JSON line accepted by the replay command.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordLine {
    #[serde(default = "RecordLine::default_topic")]
    pub topic: String,
    #[serde(default)]
    pub partition: i32,
    pub offset: i64,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl RecordLine {
    fn default_topic() -> String {
        "replay".into()
    }
}

impl From<RecordLine> for SinkRecord {
    fn from(line: RecordLine) -> Self {
        let mut headers: Vec<(String, Bytes)> = line
            .headers
            .into_iter()
            .map(|(k, v)| (k, Bytes::from(v)))
            .collect();
        headers.sort_by(|a, b| a.0.cmp(&b.0));
        SinkRecord {
            topic: line.topic,
            partition: line.partition,
            offset: line.offset,
            key: line.key.map(Bytes::from),
            value: line.value.map(Bytes::from),
            headers,
            timestamp: line.timestamp,
        }
    }
}

/// Message handed to the broker session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub payload: Bytes,
    pub key: Option<Bytes>,
    pub headers: HashMap<String, Bytes>,
    pub destination: Destination,
    pub delivery_mode: DeliveryMode,
    pub correlation_id: CorrelationId,
}

impl OutboundMessage {
    /// Copy of this message carrying a fresh correlation id, used when the
    /// unresolved remainder of a cycle is resubmitted.
    pub fn resubmitted(&self, correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            ..self.clone()
        }
    }
}

/// Per-message acknowledgment state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckState {
    Pending,
    Acked,
    Nacked(crate::policy::NackReason),
}

/// Completion record kept by the tracker for every registered id.
#[derive(Debug, Clone)]
pub struct AckRecord {
    pub correlation_id: CorrelationId,
    pub state: AckState,
    pub submitted_at: Instant,
}

impl AckRecord {
    pub fn pending(correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            state: AckState::Pending,
            submitted_at: Instant::now(),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, AckState::Pending)
    }
}

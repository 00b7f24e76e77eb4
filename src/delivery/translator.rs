//! Record translation capability.
//!
//! A translator maps one upstream record to zero or more broker messages. It is
//! chosen once when the task is built and is never reloaded. Implementations
//! must be pure: no I/O, no shared mutable state.

use crate::core::config::{MessageKeyMode, RecordConfig, RecordProcessor};
use crate::delivery::message::{Destination, SinkRecord};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Header carrying the record key as a reply-to topic.
pub const REPLY_TO_HEADER: &str = "reply_to";
/// Header carrying the record key as an application correlation id.
pub const CORRELATION_HEADER: &str = "application_correlation_id";

/// Translator output for a single message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translated {
    pub destination: Destination,
    pub payload: Bytes,
    pub key: Option<Bytes>,
    pub headers: HashMap<String, Bytes>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranslationError {
    #[error("record key is required but missing")]
    MissingKey,
    #[error("record key is not valid UTF-8")]
    KeyNotUtf8,
    #[error("no destination configured for record")]
    NoDestination,
    #[error("{0}")]
    Custom(String),
}

/// Capability turning upstream records into outbound messages.
pub trait Translator: Send + Sync {
    fn name(&self) -> &'static str;

    fn translate(&self, record: &SinkRecord) -> Result<Vec<Translated>, TranslationError>;
}

fn record_headers(record: &SinkRecord, emit: bool) -> HashMap<String, Bytes> {
    if !emit {
        return HashMap::new();
    }
    record
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn key_str(record: &SinkRecord) -> Result<&str, TranslationError> {
    let key = record.key.as_ref().ok_or(TranslationError::MissingKey)?;
    std::str::from_utf8(key).map_err(|_| TranslationError::KeyNotUtf8)
}

/// Publishes the record value unchanged to every configured destination.
#[derive(Debug, Clone)]
pub struct SimpleTranslator {
    destinations: Vec<Destination>,
    emit_headers: bool,
}

impl SimpleTranslator {
    pub fn new(destinations: Vec<Destination>, emit_headers: bool) -> Self {
        Self {
            destinations,
            emit_headers,
        }
    }
}

impl Translator for SimpleTranslator {
    fn name(&self) -> &'static str {
        "simple"
    }

    fn translate(&self, record: &SinkRecord) -> Result<Vec<Translated>, TranslationError> {
        let Some(value) = &record.value else {
            return Ok(Vec::new());
        };
        if self.destinations.is_empty() {
            return Err(TranslationError::NoDestination);
        }
        let headers = record_headers(record, self.emit_headers);
        Ok(self
            .destinations
            .iter()
            .map(|destination| Translated {
                destination: destination.clone(),
                payload: value.clone(),
                key: None,
                headers: headers.clone(),
            })
            .collect())
    }
}

/// Like [`SimpleTranslator`], additionally carrying the record key as
/// configured by [`MessageKeyMode`].
#[derive(Debug, Clone)]
pub struct KeyedTranslator {
    destinations: Vec<Destination>,
    key_mode: MessageKeyMode,
    emit_headers: bool,
}

impl KeyedTranslator {
    pub fn new(destinations: Vec<Destination>, key_mode: MessageKeyMode, emit_headers: bool) -> Self {
        Self {
            destinations,
            key_mode,
            emit_headers,
        }
    }

    fn apply_key(
        &self,
        record: &SinkRecord,
        key: &mut Option<Bytes>,
        headers: &mut HashMap<String, Bytes>,
    ) -> Result<(), TranslationError> {
        match self.key_mode {
            MessageKeyMode::None => {}
            MessageKeyMode::Key => *key = record.key.clone(),
            MessageKeyMode::ReplyTo => {
                let topic = key_str(record)?;
                headers.insert(REPLY_TO_HEADER.into(), Bytes::from(topic.to_string()));
            }
            MessageKeyMode::CorrelationId => {
                let id = key_str(record)?;
                headers.insert(CORRELATION_HEADER.into(), Bytes::from(id.to_string()));
            }
            MessageKeyMode::CorrelationIdAsBytes => {
                let raw = record.key.clone().ok_or(TranslationError::MissingKey)?;
                headers.insert(CORRELATION_HEADER.into(), raw);
            }
        }
        Ok(())
    }
}

impl Translator for KeyedTranslator {
    fn name(&self) -> &'static str {
        "keyed"
    }

    fn translate(&self, record: &SinkRecord) -> Result<Vec<Translated>, TranslationError> {
        let Some(value) = &record.value else {
            return Ok(Vec::new());
        };
        if self.destinations.is_empty() {
            return Err(TranslationError::NoDestination);
        }
        let mut key = None;
        let mut headers = record_headers(record, self.emit_headers);
        self.apply_key(record, &mut key, &mut headers)?;
        Ok(self
            .destinations
            .iter()
            .map(|destination| Translated {
                destination: destination.clone(),
                payload: value.clone(),
                key: key.clone(),
                headers: headers.clone(),
            })
            .collect())
    }
}

/// Routes each record to the topic named by its key.
#[derive(Debug, Clone, Default)]
pub struct DynamicTranslator {
    emit_headers: bool,
}

impl DynamicTranslator {
    pub fn new(emit_headers: bool) -> Self {
        Self { emit_headers }
    }
}

impl Translator for DynamicTranslator {
    fn name(&self) -> &'static str {
        "dynamic"
    }

    fn translate(&self, record: &SinkRecord) -> Result<Vec<Translated>, TranslationError> {
        let Some(value) = &record.value else {
            return Ok(Vec::new());
        };
        let topic = key_str(record)?;
        if topic.is_empty() {
            return Err(TranslationError::NoDestination);
        }
        Ok(vec![Translated {
            destination: Destination::topic(topic),
            payload: value.clone(),
            key: None,
            headers: record_headers(record, self.emit_headers),
        }])
    }
}

/// Build the configured translator.
pub fn from_config(record: &RecordConfig, destinations: Vec<Destination>) -> Arc<dyn Translator> {
    match record.processor {
        RecordProcessor::Simple => {
            Arc::new(SimpleTranslator::new(destinations, record.emit_headers))
        }
        RecordProcessor::Keyed => Arc::new(KeyedTranslator::new(
            destinations,
            record.message_key,
            record.emit_headers,
        )),
        RecordProcessor::Dynamic => Arc::new(DynamicTranslator::new(record.emit_headers)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> SinkRecord {
        SinkRecord::new("orders", 0, 42)
            .with_key("reply/topic")
            .with_value("payload")
            .with_header("trace", "abc")
    }

    #[test]
    fn simple_fans_out_to_every_destination() {
        let translator = SimpleTranslator::new(
            vec![Destination::topic("a"), Destination::queue("q")],
            false,
        );
        let out = translator.translate(&record()).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].destination, Destination::topic("a"));
        assert_eq!(out[1].destination, Destination::queue("q"));
        assert!(out[0].headers.is_empty());
        assert!(out[0].key.is_none());
    }

    #[test]
    fn tombstones_produce_no_messages() {
        let translator = SimpleTranslator::new(vec![Destination::queue("q")], false);
        let tombstone = SinkRecord::new("orders", 0, 1).with_key("k");
        assert!(translator.translate(&tombstone).unwrap().is_empty());
    }

    #[test]
    fn headers_propagate_only_when_enabled() {
        let translator = SimpleTranslator::new(vec![Destination::queue("q")], true);
        let out = translator.translate(&record()).unwrap();
        assert_eq!(out[0].headers.get("trace").map(|v| &v[..]), Some(&b"abc"[..]));
    }

    #[test]
    fn keyed_modes_place_the_key() {
        let dest = vec![Destination::queue("q")];
        let reply = KeyedTranslator::new(dest.clone(), MessageKeyMode::ReplyTo, false)
            .translate(&record())
            .unwrap();
        assert_eq!(
            reply[0].headers.get(REPLY_TO_HEADER).map(|v| &v[..]),
            Some(&b"reply/topic"[..])
        );

        let keyed = KeyedTranslator::new(dest.clone(), MessageKeyMode::Key, false)
            .translate(&record())
            .unwrap();
        assert_eq!(keyed[0].key.as_deref(), Some(&b"reply/topic"[..]));

        let missing = KeyedTranslator::new(dest, MessageKeyMode::CorrelationId, false)
            .translate(&SinkRecord::new("orders", 0, 1).with_value("v"));
        assert_eq!(missing, Err(TranslationError::MissingKey));
    }

    #[test]
    fn dynamic_routes_by_key() {
        let out = DynamicTranslator::new(false).translate(&record()).unwrap();
        assert_eq!(out, vec![Translated {
            destination: Destination::topic("reply/topic"),
            payload: Bytes::from_static(b"payload"),
            key: None,
            headers: HashMap::new(),
        }]);

        let bad = SinkRecord::new("orders", 0, 1)
            .with_key(vec![0xff, 0xfe])
            .with_value("v");
        assert_eq!(
            DynamicTranslator::new(false).translate(&bad),
            Err(TranslationError::KeyNotUtf8)
        );
    }
}

//! Common test harness utilities for integration tests.
//!
//! This module provides helpers for:
//! - Building test configurations
//! - Creating numbered records
//! - Wiring a sink task to an in-process broker

// Not all test files use all helpers; silence dead_code warnings for unused exports.
#![allow(dead_code)]

use sinkbridge::config::Config;
use sinkbridge::events::RecordingEventSink;
use sinkbridge::{MemoryBroker, SinkRecord, SinkTask};
use std::sync::Arc;

/// Single-host config publishing to queue `q` with short retry waits.
pub fn base_config() -> Config {
    Config::parse(
        r#"
[session]
hosts = ["tcp://a"]
reconnect_retries = 2
reconnect_retry_wait_ms = 10
keep_alive_interval_ms = 60000

[publisher]
ack_timeout_ms = 2000

[destinations]
queue = "q"
"#,
        false,
    )
    .expect("parse base config")
}

/// Same as [`base_config`] with the queue published under acknowledgments
/// instead of transactions.
pub fn acknowledged_config() -> Config {
    let mut cfg = base_config();
    cfg.publisher.use_transactions_for_queue = false;
    cfg
}

/// `count` records on `orders-0` with values `m<offset>` starting at `first`.
pub fn records(first: i64, count: i64) -> Vec<SinkRecord> {
    (first..first + count)
        .map(|offset| SinkRecord::new("orders", 0, offset).with_value(format!("m{offset}")))
        .collect()
}

pub fn payloads(first: i64, count: i64) -> Vec<String> {
    (first..first + count).map(|offset| format!("m{offset}")).collect()
}

/// A started task, its broker, and the events it emitted.
pub struct Harness {
    pub task: SinkTask,
    pub broker: MemoryBroker,
    pub events: RecordingEventSink,
}

pub fn harness(config: Config, broker: MemoryBroker) -> Harness {
    let events = RecordingEventSink::default();
    let task = SinkTask::with_events(config, Arc::new(broker.clone()), Arc::new(events.clone()))
        .expect("build sink task");
    Harness {
        task,
        broker,
        events,
    }
}

pub async fn started(config: Config, broker: MemoryBroker) -> Harness {
    let mut h = harness(config, broker);
    h.task.start().await.expect("start sink task");
    h
}

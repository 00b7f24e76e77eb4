//! In-process broker.
//!
//! `MemoryBroker` implements [`SessionFactory`] with scriptable behavior so the
//! delivery core can be driven end to end without a real broker: per-host
//! connect outcomes, immediate or manually released acknowledgments, nack
//! rules, commit failures, keep-alive silence and dropped connections.

use super::{BrokerSession, SessionError, SessionFactory, SessionProperties};
use crate::delivery::message::{CorrelationId, DeliveryMode, Destination, OutboundMessage};
use crate::messaging::acks::AckHandle;
use crate::policy::NackReason;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How a host answers connection attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostBehavior {
    Accept,
    Refuse,
    /// Refuse this many attempts, then accept.
    RefuseTimes(u32),
    RejectCredentials,
}

/// When persistent messages are acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerAckMode {
    Immediate,
    /// Held until [`MemoryBroker::release_acks`] or [`MemoryBroker::release_all`].
    Manual,
}

/// A message the broker accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub host: String,
    pub destination: Destination,
    pub payload: Bytes,
    pub key: Option<Bytes>,
    pub headers: HashMap<String, Bytes>,
    pub delivery_mode: DeliveryMode,
    pub transacted: bool,
}

impl Delivered {
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

struct BrokerState {
    hosts: HashMap<String, HostBehavior>,
    default_host: HostBehavior,
    ack_mode: BrokerAckMode,
    nack_rules: Vec<(Bytes, NackReason)>,
    commit_failures: u32,
    drop_after: Option<u32>,
    keep_alive: bool,
    generation: u64,
    pending: VecDeque<(CorrelationId, AckHandle)>,
    max_in_flight: usize,
    delivered: Vec<Delivered>,
    rejected: Vec<(Bytes, NackReason)>,
    commits: u64,
    rollbacks: u64,
    connect_log: Vec<String>,
    open_sessions: usize,
    last_properties: Option<SessionProperties>,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            hosts: HashMap::new(),
            default_host: HostBehavior::Accept,
            ack_mode: BrokerAckMode::Immediate,
            nack_rules: Vec::new(),
            commit_failures: 0,
            drop_after: None,
            keep_alive: true,
            generation: 0,
            pending: VecDeque::new(),
            max_in_flight: 0,
            delivered: Vec::new(),
            rejected: Vec::new(),
            commits: 0,
            rollbacks: 0,
            connect_log: Vec::new(),
            open_sessions: 0,
            last_properties: None,
        }
    }
}

impl BrokerState {
    fn nack_for(&self, payload: &Bytes) -> Option<NackReason> {
        self.nack_rules
            .iter()
            .find(|(p, _)| p == payload)
            .map(|(_, reason)| reason.clone())
    }

    fn sever(&mut self) {
        self.generation += 1;
        self.pending.clear();
    }

    /// Counts down injected connection drops; `true` when this call must fail.
    fn drop_due(&mut self) -> bool {
        match self.drop_after {
            Some(0) => {
                self.drop_after = None;
                self.sever();
                true
            }
            Some(n) => {
                self.drop_after = Some(n - 1);
                false
            }
            None => false,
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    // ---------------------------------------------------------------------
    // Scripting
    // ---------------------------------------------------------------------

    pub fn set_host(&self, host: &str, behavior: HostBehavior) {
        self.inner.lock().hosts.insert(host.to_string(), behavior);
    }

    pub fn set_default_host(&self, behavior: HostBehavior) {
        self.inner.lock().default_host = behavior;
    }

    pub fn set_ack_mode(&self, mode: BrokerAckMode) {
        self.inner.lock().ack_mode = mode;
    }

    /// Reject every persistent message whose payload equals `payload`.
    pub fn nack_payload(&self, payload: impl Into<Bytes>, reason: NackReason) {
        self.inner.lock().nack_rules.push((payload.into(), reason));
    }

    pub fn fail_next_commits(&self, count: u32) {
        self.inner.lock().commit_failures = count;
    }

    pub fn set_keep_alive(&self, responds: bool) {
        self.inner.lock().keep_alive = responds;
    }

    /// Sever every open session; their pending acknowledgments are lost.
    pub fn drop_connections(&self) {
        self.inner.lock().sever();
    }

    /// Allow `count` more publishes, then sever connections on the next one.
    pub fn drop_after_publishes(&self, count: u32) {
        self.inner.lock().drop_after = Some(count);
    }

    /// Acknowledge up to `count` held messages, oldest first.
    pub fn release_acks(&self, count: usize) -> usize {
        let released: Vec<(CorrelationId, AckHandle)> = {
            let mut state = self.inner.lock();
            let n = count.min(state.pending.len());
            state.pending.drain(..n).collect()
        };
        for (id, handle) in &released {
            handle.on_ack(*id);
        }
        released.len()
    }

    /// Acknowledge every held message with one cumulative confirmation.
    pub fn release_all(&self) -> usize {
        let released: Vec<(CorrelationId, AckHandle)> =
            self.inner.lock().pending.drain(..).collect();
        if let Some((last, handle)) = released.iter().max_by_key(|(id, _)| *id) {
            handle.on_ack_up_to(*last);
        }
        released.len()
    }

    // ---------------------------------------------------------------------
    // Inspection
    // ---------------------------------------------------------------------

    pub fn delivered(&self) -> Vec<Delivered> {
        self.inner.lock().delivered.clone()
    }

    pub fn delivered_payloads(&self) -> Vec<String> {
        self.inner
            .lock()
            .delivered
            .iter()
            .map(Delivered::payload_str)
            .collect()
    }

    pub fn rejected(&self) -> Vec<(Bytes, NackReason)> {
        self.inner.lock().rejected.clone()
    }

    pub fn pending_acks(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Largest number of unacknowledged persistent messages seen at once.
    pub fn max_in_flight(&self) -> usize {
        self.inner.lock().max_in_flight
    }

    pub fn commits(&self) -> u64 {
        self.inner.lock().commits
    }

    pub fn rollbacks(&self) -> u64 {
        self.inner.lock().rollbacks
    }

    pub fn connect_log(&self) -> Vec<String> {
        self.inner.lock().connect_log.clone()
    }

    pub fn open_sessions(&self) -> usize {
        self.inner.lock().open_sessions
    }

    pub fn last_properties(&self) -> Option<SessionProperties> {
        self.inner.lock().last_properties.clone()
    }

    /// Poll until at least `count` messages were delivered or `timeout` passes.
    pub async fn wait_for_delivered(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.inner.lock().delivered.len() >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl SessionFactory for MemoryBroker {
    async fn open(
        &self,
        host: &str,
        properties: &SessionProperties,
        acks: AckHandle,
    ) -> Result<Arc<dyn BrokerSession>, SessionError> {
        let mut state = self.inner.lock();
        state.connect_log.push(host.to_string());
        state.last_properties = Some(properties.clone());
        let default = state.default_host.clone();
        let behavior = state.hosts.entry(host.to_string()).or_insert(default);
        match behavior {
            HostBehavior::Accept => {}
            HostBehavior::Refuse => {
                return Err(SessionError::Refused {
                    host: host.to_string(),
                    reason: "connection refused".into(),
                })
            }
            HostBehavior::RefuseTimes(remaining) => {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(SessionError::Refused {
                        host: host.to_string(),
                        reason: "connection refused".into(),
                    });
                }
            }
            HostBehavior::RejectCredentials => {
                return Err(SessionError::Authentication {
                    host: host.to_string(),
                    reason: "invalid username or password".into(),
                })
            }
        }
        state.open_sessions += 1;
        let generation = state.generation;
        Ok(Arc::new(MemorySession {
            host: host.to_string(),
            broker: self.inner.clone(),
            acks,
            generation,
            txn: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemorySession {
    host: String,
    broker: Arc<Mutex<BrokerState>>,
    acks: AckHandle,
    generation: u64,
    txn: Mutex<Vec<Delivered>>,
    closed: AtomicBool,
}

impl MemorySession {
    fn check(&self, state: &BrokerState) -> Result<(), SessionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }
        if state.generation != self.generation {
            return Err(SessionError::Transport("connection lost".into()));
        }
        Ok(())
    }

    fn delivered(&self, message: &OutboundMessage, transacted: bool) -> Delivered {
        Delivered {
            host: self.host.clone(),
            destination: message.destination.clone(),
            payload: message.payload.clone(),
            key: message.key.clone(),
            headers: message.headers.clone(),
            delivery_mode: message.delivery_mode,
            transacted,
        }
    }

    fn release(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let mut state = self.broker.lock();
            state.open_sessions = state.open_sessions.saturating_sub(1);
        }
    }
}

#[async_trait]
impl BrokerSession for MemorySession {
    fn host(&self) -> &str {
        &self.host
    }

    async fn publish(&self, message: &OutboundMessage) -> Result<(), SessionError> {
        let mut state = self.broker.lock();
        self.check(&state)?;
        if state.drop_due() {
            return Err(SessionError::Transport("connection reset by broker".into()));
        }
        if message.delivery_mode == DeliveryMode::Persistent {
            if let Some(reason) = state.nack_for(&message.payload) {
                state.rejected.push((message.payload.clone(), reason.clone()));
                drop(state);
                self.acks.on_nack(message.correlation_id, reason);
                return Ok(());
            }
        }
        let record = self.delivered(message, false);
        state.delivered.push(record);
        if message.delivery_mode == DeliveryMode::Direct {
            return Ok(());
        }
        let ack_mode = state.ack_mode;
        match ack_mode {
            BrokerAckMode::Immediate => {
                drop(state);
                self.acks.on_ack(message.correlation_id);
            }
            BrokerAckMode::Manual => {
                state
                    .pending
                    .push_back((message.correlation_id, self.acks.clone()));
                state.max_in_flight = state.max_in_flight.max(state.pending.len());
            }
        }
        Ok(())
    }

    async fn publish_transacted(&self, message: &OutboundMessage) -> Result<(), SessionError> {
        let mut state = self.broker.lock();
        self.check(&state)?;
        if state.drop_due() {
            self.txn.lock().clear();
            return Err(SessionError::Transport("connection reset by broker".into()));
        }
        drop(state);
        let record = self.delivered(message, true);
        self.txn.lock().push(record);
        Ok(())
    }

    async fn commit(&self) -> Result<(), SessionError> {
        let mut state = self.broker.lock();
        self.check(&state)?;
        let staged: Vec<Delivered> = std::mem::take(&mut *self.txn.lock());
        if state.commit_failures > 0 {
            state.commit_failures -= 1;
            return Err(SessionError::CommitFailed(format!(
                "transaction of {} messages rolled back",
                staged.len()
            )));
        }
        state.delivered.extend(staged);
        state.commits += 1;
        Ok(())
    }

    async fn rollback(&self) -> Result<(), SessionError> {
        let mut state = self.broker.lock();
        self.check(&state)?;
        self.txn.lock().clear();
        state.rollbacks += 1;
        Ok(())
    }

    async fn keep_alive(&self) -> Result<(), SessionError> {
        let state = self.broker.lock();
        self.check(&state)?;
        if state.keep_alive {
            Ok(())
        } else {
            Err(SessionError::Timeout {
                operation: "keep-alive",
                after: Duration::ZERO,
            })
        }
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.txn.lock().clear();
        self.release();
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{AckEventMode, Config};
    use crate::messaging::acks::{AckTracker, Resolution};
    use tokio::sync::watch;

    fn properties() -> SessionProperties {
        let cfg = Config::parse(
            "[session]\nhosts = [\"a\"]\n[destinations]\nqueue = \"q\"\n",
            false,
        )
        .unwrap();
        SessionProperties::from_config(&cfg)
    }

    fn message(id: u64, payload: &'static str) -> OutboundMessage {
        OutboundMessage {
            payload: Bytes::from_static(payload.as_bytes()),
            key: None,
            headers: HashMap::new(),
            destination: Destination::queue("q"),
            delivery_mode: DeliveryMode::Persistent,
            correlation_id: CorrelationId(id),
        }
    }

    #[tokio::test]
    async fn host_behaviors_are_scripted() {
        let broker = MemoryBroker::new();
        let tracker = AckTracker::new(AckEventMode::PerMessage, 1);
        broker.set_host("a", HostBehavior::RefuseTimes(1));
        broker.set_host("b", HostBehavior::RejectCredentials);
        let props = properties();
        assert!(broker.open("a", &props, tracker.handle()).await.is_err());
        assert!(broker.open("a", &props, tracker.handle()).await.is_ok());
        assert!(matches!(
            broker.open("b", &props, tracker.handle()).await,
            Err(SessionError::Authentication { .. })
        ));
        assert_eq!(broker.connect_log(), vec!["a", "a", "b"]);
        // the accepted session from "a" was dropped right away
        assert_eq!(broker.open_sessions(), 0);
    }

    #[tokio::test]
    async fn manual_acks_flow_back_through_the_handle() {
        let broker = MemoryBroker::new();
        broker.set_ack_mode(BrokerAckMode::Manual);
        let (_tx, mut shutdown) = watch::channel(false);
        let mut tracker = AckTracker::new(AckEventMode::Windowed, 8);
        let session = broker
            .open("a", &properties(), tracker.handle())
            .await
            .unwrap();
        for n in 1..=3 {
            tracker
                .register(CorrelationId(n), Duration::from_secs(1), &mut shutdown)
                .await
                .unwrap();
            session.publish(&message(n, "m")).await.unwrap();
        }
        assert_eq!(broker.max_in_flight(), 3);
        assert_eq!(broker.release_acks(1), 1);
        assert_eq!(broker.release_all(), 2);
        assert_eq!(
            tracker
                .await_resolution(Duration::from_secs(1), &mut shutdown)
                .await,
            Resolution::Resolved
        );
    }

    #[tokio::test]
    async fn dropped_connections_fail_publishes() {
        let broker = MemoryBroker::new();
        let tracker = AckTracker::new(AckEventMode::PerMessage, 1);
        let session = broker
            .open("a", &properties(), tracker.handle())
            .await
            .unwrap();
        broker.drop_after_publishes(1);
        session.publish(&message(1, "one")).await.unwrap();
        assert!(matches!(
            session.publish(&message(2, "two")).await,
            Err(SessionError::Transport(_))
        ));
        assert!(matches!(
            session.keep_alive().await,
            Err(SessionError::Transport(_))
        ));
        session.close().await.unwrap();
        assert_eq!(broker.open_sessions(), 0);
        assert_eq!(broker.delivered_payloads(), vec!["one"]);
    }

    #[tokio::test]
    async fn commit_failure_discards_the_transaction() {
        let broker = MemoryBroker::new();
        let tracker = AckTracker::new(AckEventMode::PerMessage, 1);
        let session = broker
            .open("a", &properties(), tracker.handle())
            .await
            .unwrap();
        broker.fail_next_commits(1);
        session.publish_transacted(&message(1, "x")).await.unwrap();
        assert!(matches!(
            session.commit().await,
            Err(SessionError::CommitFailed(_))
        ));
        session.publish_transacted(&message(2, "y")).await.unwrap();
        session.commit().await.unwrap();
        assert_eq!(broker.delivered_payloads(), vec!["y"]);
        assert_eq!(broker.commits(), 1);
    }
}

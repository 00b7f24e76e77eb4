//! Connection manager.
//!
//! Owns the task's broker session and its state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected | Failed
//! Connected -> Reconnecting -> Connected | Failed
//! Failed -> Reconnecting            (explicit ensure_connected)
//! any -> Disconnected               (close)
//! ```
//!
//! Every transition is published on a broadcast channel and mirrored into a
//! `watch` so readers can observe the current state without locking.

use super::keepalive;
use super::{BrokerSession, SessionError, SessionFactory, SessionProperties, SessionState};
use crate::messaging::acks::AckHandle;
use crate::ops::{EventSink, SinkEvent, SinkMetrics};
use crate::policy::SinkError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One broker address and the attempts made against it in the current pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEndpoint {
    pub address: String,
    /// Attempts made against this host in the current pass.
    pub retry_count: u32,
    /// Extra attempts allowed after the first.
    pub retry_budget: u32,
}

impl HostEndpoint {
    pub fn new(address: impl Into<String>, retry_budget: u32) -> Self {
        Self {
            address: address.into(),
            retry_count: 0,
            retry_budget,
        }
    }

    pub fn has_attempts_left(&self) -> bool {
        self.retry_count <= self.retry_budget
    }
}

/// Published on every state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    pub from: SessionState,
    pub to: SessionState,
    pub host: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connect,
    Reconnect,
}

struct AttemptLog {
    last: Result<(), SinkError>,
}

pub struct ConnectionManager {
    factory: Arc<dyn SessionFactory>,
    properties: SessionProperties,
    acks: AckHandle,
    metrics: Arc<SinkMetrics>,
    events: Arc<dyn EventSink>,
    session: Mutex<Option<Arc<dyn BrokerSession>>>,
    state_tx: watch::Sender<SessionState>,
    transitions: broadcast::Sender<StateTransition>,
    attempt: tokio::sync::Mutex<AttemptLog>,
    generation: AtomicU64,
    close_epoch: AtomicU64,
    keep_alive: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(
        factory: Arc<dyn SessionFactory>,
        properties: SessionProperties,
        acks: AckHandle,
        metrics: Arc<SinkMetrics>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let (transitions, _) = broadcast::channel(64);
        Self {
            factory,
            properties,
            acks,
            metrics,
            events,
            session: Mutex::new(None),
            state_tx,
            transitions,
            attempt: tokio::sync::Mutex::new(AttemptLog { last: Ok(()) }),
            generation: AtomicU64::new(0),
            close_epoch: AtomicU64::new(0),
            keep_alive: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        self.transitions.subscribe()
    }

    pub fn properties(&self) -> &SessionProperties {
        &self.properties
    }

    pub fn metrics(&self) -> &Arc<SinkMetrics> {
        &self.metrics
    }

    /// The live session, if connected.
    pub fn session(&self) -> Result<Arc<dyn BrokerSession>, SinkError> {
        self.session
            .lock()
            .clone()
            .ok_or_else(|| SinkError::Connection(format!("no active session ({})", self.state())))
    }

    pub fn current_host(&self) -> Option<String> {
        self.session.lock().as_ref().map(|s| s.host().to_string())
    }

    /// Establish the session using the initial connect budget.
    pub async fn connect(&self) -> Result<(), SinkError> {
        self.coalesced(Some(Phase::Connect)).await
    }

    /// Make sure a session is up, running the state machine when it is not.
    ///
    /// From `Disconnected` the connect budget applies; from `Reconnecting` or
    /// `Failed` the reconnect budget applies. Callers arriving while another
    /// attempt runs wait for that attempt and share its result.
    pub async fn ensure_connected(&self) -> Result<(), SinkError> {
        if self.state() == SessionState::Connected {
            return Ok(());
        }
        self.coalesced(None).await
    }

    async fn coalesced(&self, forced: Option<Phase>) -> Result<(), SinkError> {
        let seen = self.generation.load(Ordering::SeqCst);
        let mut log = self.attempt.lock().await;
        if self.state() == SessionState::Connected {
            return Ok(());
        }
        if self.generation.load(Ordering::SeqCst) != seen {
            return log.last.clone();
        }
        let phase = forced.unwrap_or(match self.state() {
            SessionState::Disconnected | SessionState::Connecting => Phase::Connect,
            SessionState::Reconnecting | SessionState::Failed => Phase::Reconnect,
            SessionState::Connected => return Ok(()),
        });
        let result = self.establish(phase).await;
        log.last = result.clone();
        self.generation.fetch_add(1, Ordering::SeqCst);
        result
    }

    async fn establish(&self, phase: Phase) -> Result<(), SinkError> {
        let epoch = self.close_epoch.load(Ordering::SeqCst);
        let hosts = self.properties.hosts.clone();
        if hosts.is_empty() {
            self.transition(SessionState::Failed, None, Some("no hosts configured"));
            return Err(SinkError::Configuration("no broker hosts configured".into()));
        }
        let (entry, extra_passes) = match phase {
            Phase::Connect => (SessionState::Connecting, self.properties.connect_retries),
            Phase::Reconnect => (SessionState::Reconnecting, self.properties.reconnect_retries),
        };
        self.transition(entry, None, None);

        let passes = 1 + extra_passes;
        let wait = self.properties.reconnect_retry_wait;
        let mut attempts: u32 = 0;
        for pass in 0..passes {
            for address in &hosts {
                let mut endpoint =
                    HostEndpoint::new(address.clone(), self.properties.connect_retries_per_host);
                while endpoint.has_attempts_left() {
                    if attempts > 0 {
                        tokio::time::sleep(wait).await;
                    }
                    if self.close_epoch.load(Ordering::SeqCst) != epoch {
                        return Err(SinkError::Cancelled);
                    }
                    attempts += 1;
                    endpoint.retry_count += 1;
                    self.metrics.connect_attempt();
                    match self.open(address).await {
                        Ok(session) => return self.install(session, epoch).await,
                        Err(SessionError::Authentication { host, reason }) => {
                            self.transition(SessionState::Failed, Some(&host), Some(&reason));
                            return Err(SinkError::Authentication { host, reason });
                        }
                        Err(err) => {
                            warn!(
                                host = %address,
                                pass = pass + 1,
                                attempt = endpoint.retry_count,
                                error = %err,
                                "connect attempt failed"
                            );
                        }
                    }
                }
            }
        }
        let err = SinkError::HostsExhausted {
            hosts: hosts.len(),
            attempts,
        };
        self.transition(SessionState::Failed, None, Some(&err.to_string()));
        Err(err)
    }

    async fn open(&self, address: &str) -> Result<Arc<dyn BrokerSession>, SessionError> {
        let timeout = self.properties.connect_timeout;
        match tokio::time::timeout(
            timeout,
            self.factory.open(address, &self.properties, self.acks.clone()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SessionError::Timeout {
                operation: "connect",
                after: timeout,
            }),
        }
    }

    async fn install(&self, session: Arc<dyn BrokerSession>, epoch: u64) -> Result<(), SinkError> {
        if self.close_epoch.load(Ordering::SeqCst) != epoch {
            let _ = session.close().await;
            return Err(SinkError::Cancelled);
        }
        let host = session.host().to_string();
        let previous = self.session.lock().replace(session);
        if let Some(previous) = previous {
            let _ = previous.close().await;
        }
        info!(host = %host, "broker session established");
        self.transition(SessionState::Connected, Some(&host), None);
        Ok(())
    }

    /// Tear down `failed` after it surfaced a transport failure. The next
    /// [`ensure_connected`](Self::ensure_connected) reconnects.
    ///
    /// When `failed` has already been replaced by a newer session, only the
    /// stale one is closed and the installed session stays up.
    pub async fn mark_broken(&self, failed: &Arc<dyn BrokerSession>, reason: &str) {
        let previous = {
            let mut installed = self.session.lock();
            let same = installed
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, failed));
            if same {
                installed.take()
            } else {
                None
            }
        };
        let Some(session) = previous else {
            debug!(host = failed.host(), reason, "ignoring failure of a replaced session");
            if let Err(err) = failed.close().await {
                debug!(error = %err, "closing replaced session failed");
            }
            return;
        };
        let host = session.host().to_string();
        if let Err(err) = session.close().await {
            debug!(error = %err, "closing broken session failed");
        }
        if self.state() == SessionState::Connected {
            self.metrics.reconnect();
            self.transition(SessionState::Reconnecting, Some(&host), Some(reason));
        }
    }

    /// Release the session. Always ends `Disconnected`.
    pub async fn close(&self) {
        self.close_epoch.fetch_add(1, Ordering::SeqCst);
        let monitor = self.keep_alive.lock().take();
        if let Some(handle) = monitor {
            handle.abort();
        }
        let previous = self.session.lock().take();
        if let Some(session) = previous {
            if let Err(err) = session.close().await {
                warn!(host = session.host(), error = %err, "session close reported an error");
            }
        }
        self.transition(SessionState::Disconnected, None, Some("closed"));
    }

    /// Spawn the keep-alive monitor; it stops on shutdown or [`close`](Self::close).
    pub fn start_keep_alive(self: &Arc<Self>, shutdown: watch::Receiver<bool>) {
        let handle = tokio::spawn(keepalive::monitor(self.clone(), shutdown));
        let previous = self.keep_alive.lock().replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn transition(&self, to: SessionState, host: Option<&str>, reason: Option<&str>) {
        let from = self.state_tx.send_replace(to);
        if from == to {
            return;
        }
        self.metrics.set_session_state(to);
        info!(
            from = from.as_str(),
            to = to.as_str(),
            host = host.unwrap_or("-"),
            reason = reason.unwrap_or(""),
            "session state changed"
        );
        let _ = self.transitions.send(StateTransition {
            from,
            to,
            host: host.map(str::to_string),
            reason: reason.map(str::to_string),
        });
        self.events.emit(SinkEvent::StateChanged {
            from,
            to,
            host: host.map(str::to_string),
        });
    }
}

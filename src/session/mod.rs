//! Broker session abstraction and lifecycle.
//!
//! - `properties` - Session properties derived from configuration
//! - `connection` - Connection manager: failover, reconnect, teardown
//! - `keepalive` - Liveness monitor driving reconnects
//! - `memory` - In-process broker used by tests and the replay command

pub mod connection;
pub mod keepalive;
pub mod memory;
pub mod properties;

pub use connection::*;
pub use memory::*;
pub use properties::*;

use crate::delivery::message::OutboundMessage;
use crate::messaging::acks::AckHandle;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Lifecycle state of the task's broker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("host {host} refused the connection: {reason}")]
    Refused { host: String, reason: String },
    #[error("authentication failed on {host}: {reason}")]
    Authentication { host: String, reason: String },
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("session closed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("commit failed: {0}")]
    CommitFailed(String),
}

/// One open session to a broker host.
///
/// Publish calls hand the message to the transport and return; confirmation
/// for persistent messages arrives later through the [`AckHandle`] the session
/// was opened with.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    fn host(&self) -> &str;

    /// Publish outside any transaction.
    async fn publish(&self, message: &OutboundMessage) -> Result<(), SessionError>;

    /// Publish inside the session's open transaction.
    async fn publish_transacted(&self, message: &OutboundMessage) -> Result<(), SessionError>;

    async fn commit(&self) -> Result<(), SessionError>;

    async fn rollback(&self) -> Result<(), SessionError>;

    /// Liveness check; an error counts as a missed keep-alive.
    async fn keep_alive(&self) -> Result<(), SessionError>;

    async fn close(&self) -> Result<(), SessionError>;
}

/// Opens sessions; injected into the connection manager at construction.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(
        &self,
        host: &str,
        properties: &SessionProperties,
        acks: AckHandle,
    ) -> Result<Arc<dyn BrokerSession>, SessionError>;
}

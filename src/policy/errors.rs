//! Failure taxonomy surfaced by the session, the tracker, and translators.

use crate::delivery::message::CorrelationId;
use crate::delivery::translator::TranslationError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Reason a broker attached to a negative acknowledgment.
///
/// Subscription-related reasons come back when the broker manages topic
/// subscriptions on behalf of a queue endpoint; the operator may choose to
/// ignore them per message instead of failing the batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NackReason {
    /// The subscription the message relied on was already present.
    SubscriptionAlreadyPresent,
    /// The subscription the message relied on could not be found.
    SubscriptionNotFound,
    /// The destination queue or topic endpoint does not exist.
    DestinationNotFound,
    /// Client is not permitted to publish to the destination.
    PermissionDenied,
    /// Message exceeds the broker's maximum message size.
    MessageTooLarge,
    /// Destination spool is over quota.
    SpoolOverQuota,
    /// Any other broker-reported rejection.
    Other(String),
}

impl NackReason {
    pub fn as_str(&self) -> &str {
        match self {
            NackReason::SubscriptionAlreadyPresent => "subscription_already_present",
            NackReason::SubscriptionNotFound => "subscription_not_found",
            NackReason::DestinationNotFound => "destination_not_found",
            NackReason::PermissionDenied => "permission_denied",
            NackReason::MessageTooLarge => "message_too_large",
            NackReason::SpoolOverQuota => "spool_over_quota",
            NackReason::Other(reason) => reason.as_str(),
        }
    }

    /// Map a broker response string onto a reason, falling back to `Other`.
    pub fn from_response(response: &str) -> Self {
        match response.to_ascii_lowercase().replace([' ', '-'], "_").as_str() {
            "subscription_already_present" | "subscription_already_exists" => {
                NackReason::SubscriptionAlreadyPresent
            }
            "subscription_not_found" => NackReason::SubscriptionNotFound,
            "destination_not_found" | "unknown_queue_name" | "unknown_topic" => {
                NackReason::DestinationNotFound
            }
            "permission_denied" | "permission_not_allowed" => NackReason::PermissionDenied,
            "message_too_large" | "document_is_too_large" => NackReason::MessageTooLarge,
            "spool_over_quota" | "queue_full" => NackReason::SpoolOverQuota,
            _ => NackReason::Other(response.to_string()),
        }
    }
}

impl fmt::Display for NackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every failure the delivery core can observe.
#[derive(Debug, Clone, Error)]
pub enum SinkError {
    /// Transport or session failure; drives reconnect.
    #[error("connection error: {0}")]
    Connection(String),
    /// Broker refused the credentials.
    #[error("authentication failed on {host}: {reason}")]
    Authentication { host: String, reason: String },
    /// Every host in every configured pass refused the connection.
    #[error("all {hosts} hosts exhausted after {attempts} connect attempts")]
    HostsExhausted { hosts: usize, attempts: u32 },
    /// Broker rejected one specific message.
    #[error("message {id} rejected by broker: {reason}")]
    DeliveryNack { id: CorrelationId, reason: NackReason },
    /// A buffered transaction could not be committed.
    #[error("commit of {messages} transacted messages failed: {reason}")]
    TransactionCommit { messages: usize, reason: String },
    /// Translator could not map a record.
    #[error("record {record} could not be translated: {source}")]
    Translation {
        record: String,
        source: TranslationError,
    },
    /// Construction-time configuration problem.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Outstanding acknowledgments did not arrive in time.
    #[error("acknowledgments outstanding after {0:?}")]
    AckTimeout(Duration),
    /// Task shutdown interrupted the cycle.
    #[error("publish cycle cancelled by shutdown")]
    Cancelled,
    /// Cycle-level retries ran out.
    #[error("cycle retry budget of {retries} exhausted: {last}")]
    RetriesExhausted { retries: u32, last: String },
}

impl SinkError {
    pub fn kind(&self) -> &'static str {
        match self {
            SinkError::Connection(_) => "connection",
            SinkError::Authentication { .. } => "authentication",
            SinkError::HostsExhausted { .. } => "hosts_exhausted",
            SinkError::DeliveryNack { .. } => "delivery_nack",
            SinkError::TransactionCommit { .. } => "transaction_commit",
            SinkError::Translation { .. } => "translation",
            SinkError::Configuration(_) => "configuration",
            SinkError::AckTimeout(_) => "ack_timeout",
            SinkError::Cancelled => "cancelled",
            SinkError::RetriesExhausted { .. } => "retries_exhausted",
        }
    }
}

impl From<crate::session::SessionError> for SinkError {
    fn from(err: crate::session::SessionError) -> Self {
        use crate::session::SessionError;
        match err {
            SessionError::Authentication { host, reason } => {
                SinkError::Authentication { host, reason }
            }
            SessionError::CommitFailed(reason) => SinkError::TransactionCommit {
                messages: 0,
                reason,
            },
            other => SinkError::Connection(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_responses_map_to_reasons() {
        assert_eq!(
            NackReason::from_response("Subscription Not Found"),
            NackReason::SubscriptionNotFound
        );
        assert_eq!(
            NackReason::from_response("subscription-already-present"),
            NackReason::SubscriptionAlreadyPresent
        );
        assert_eq!(
            NackReason::from_response("Queue Full"),
            NackReason::SpoolOverQuota
        );
        assert_eq!(
            NackReason::from_response("Replication Is Standby"),
            NackReason::Other("Replication Is Standby".into())
        );
    }

    #[test]
    fn session_auth_errors_stay_distinct() {
        let err: SinkError = crate::session::SessionError::Authentication {
            host: "h1".into(),
            reason: "bad password".into(),
        }
        .into();
        assert_eq!(err.kind(), "authentication");

        let err: SinkError = crate::session::SessionError::Closed.into();
        assert_eq!(err.kind(), "connection");
    }
}

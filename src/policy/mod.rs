//! Error classification.
//!
//! Every failure surfaced during a publish cycle is classified here before the
//! coordinator decides what to do with it. The classifier is a pure function of
//! the error and the operator's ignore/discard flags.

pub mod errors;

pub use errors::*;

use crate::core::config::Config;

/// What the coordinator should do about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Reconnect and retry the unresolved remainder of the cycle.
    RetrySession,
    /// Fail the cycle; the caller withholds the offset and redelivers.
    FailCycle,
    /// Exclude the affected record or message and continue.
    Ignore,
    /// Stop the task.
    Fatal,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::RetrySession => "retry_session",
            Disposition::FailCycle => "fail_cycle",
            Disposition::Ignore => "ignore",
            Disposition::Fatal => "fatal",
        }
    }
}

/// Operator switches that turn specific failures into ignorable ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorPolicy {
    pub ignore_duplicate_subscription: bool,
    pub ignore_subscription_not_found: bool,
    pub discard_on_processor_error: bool,
}

impl ErrorPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ignore_duplicate_subscription: config.errors.ignore_duplicate_subscription,
            ignore_subscription_not_found: config.errors.ignore_subscription_not_found,
            discard_on_processor_error: config.record.ignore_processor_error,
        }
    }

    pub fn classify(&self, error: &SinkError) -> Disposition {
        match error {
            SinkError::Connection(_) | SinkError::AckTimeout(_) => Disposition::RetrySession,
            SinkError::Authentication { .. }
            | SinkError::HostsExhausted { .. }
            | SinkError::Configuration(_) => Disposition::Fatal,
            SinkError::DeliveryNack { reason, .. } => self.classify_nack(reason),
            SinkError::Translation { .. } => {
                if self.discard_on_processor_error {
                    Disposition::Ignore
                } else {
                    Disposition::Fatal
                }
            }
            SinkError::TransactionCommit { .. }
            | SinkError::Cancelled
            | SinkError::RetriesExhausted { .. } => Disposition::FailCycle,
        }
    }

    pub fn classify_nack(&self, reason: &NackReason) -> Disposition {
        match reason {
            NackReason::SubscriptionAlreadyPresent if self.ignore_duplicate_subscription => {
                Disposition::Ignore
            }
            NackReason::SubscriptionNotFound if self.ignore_subscription_not_found => {
                Disposition::Ignore
            }
            NackReason::PermissionDenied => Disposition::Fatal,
            _ => Disposition::FailCycle,
        }
    }
}

//! Local transaction buffering for transacted publishing.
//!
//! Messages published inside a broker transaction are staged here until the
//! coordinator commits. The buffer decides when the autoflush threshold is
//! reached and hands back the staged contents if the transaction is lost.

use crate::core::config::MAX_TRANSACTION_SIZE;
use crate::delivery::message::OutboundMessage;
use std::fmt;

// ---------------------------------------------------------------------------
// Transaction State Machine
// ---------------------------------------------------------------------------

/// Transaction buffer states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Nothing staged.
    Empty,
    /// At least one message published inside the open transaction.
    Ongoing,
    /// Commit requested and not yet answered.
    Committing,
}

impl TransactionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionState::Empty => "empty",
            TransactionState::Ongoing => "ongoing",
            TransactionState::Committing => "committing",
        }
    }

    pub fn can_stage(&self) -> bool {
        matches!(self, TransactionState::Empty | TransactionState::Ongoing)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    InvalidState {
        current: TransactionState,
        operation: &'static str,
    },
    Full {
        limit: usize,
    },
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionError::InvalidState { current, operation } => {
                write!(f, "cannot {} in state {}", operation, current.as_str())
            }
            TransactionError::Full { limit } => {
                write!(f, "transaction already holds {} messages", limit)
            }
        }
    }
}

impl std::error::Error for TransactionError {}

// ---------------------------------------------------------------------------
// Transaction Buffer
// ---------------------------------------------------------------------------

/// Staged contents of the open broker transaction.
#[derive(Debug, Clone)]
pub struct TransactionBuffer {
    autoflush: usize,
    state: TransactionState,
    staged: Vec<(usize, OutboundMessage)>,
}

impl TransactionBuffer {
    /// `autoflush` is clamped to the broker's transaction ceiling.
    pub fn new(autoflush: usize) -> Self {
        Self {
            autoflush: autoflush.clamp(1, MAX_TRANSACTION_SIZE),
            state: TransactionState::Empty,
            staged: Vec::new(),
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Record a message already published inside the transaction.
    ///
    /// `position` is the message's index in the cycle; it is handed back by
    /// [`abandon`](Self::abandon) so the remainder can be resubmitted in order.
    /// Returns `true` when the autoflush threshold is reached.
    pub fn stage(
        &mut self,
        position: usize,
        message: OutboundMessage,
    ) -> Result<bool, TransactionError> {
        if !self.state.can_stage() {
            return Err(TransactionError::InvalidState {
                current: self.state,
                operation: "stage",
            });
        }
        if self.staged.len() >= MAX_TRANSACTION_SIZE {
            return Err(TransactionError::Full {
                limit: MAX_TRANSACTION_SIZE,
            });
        }
        self.staged.push((position, message));
        self.state = TransactionState::Ongoing;
        Ok(self.staged.len() >= self.autoflush)
    }

    /// Enter the committing state; returns the number of staged messages.
    pub fn begin_commit(&mut self) -> Result<usize, TransactionError> {
        if self.state != TransactionState::Ongoing {
            return Err(TransactionError::InvalidState {
                current: self.state,
                operation: "commit",
            });
        }
        self.state = TransactionState::Committing;
        Ok(self.staged.len())
    }

    /// Commit confirmed by the broker.
    pub fn committed(&mut self) -> Vec<(usize, OutboundMessage)> {
        self.state = TransactionState::Empty;
        std::mem::take(&mut self.staged)
    }

    /// Drop the open transaction, returning what it held.
    pub fn abandon(&mut self) -> Vec<(usize, OutboundMessage)> {
        self.state = TransactionState::Empty;
        std::mem::take(&mut self.staged)
    }
}

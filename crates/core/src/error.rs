//! Error types for Rewind
//!
//! Two families live here:
//! - `RewindError`: usage errors returned by the runtime primitives
//!   (misuse of the nesting protocol, state machine violations, config errors)
//! - `AbortReason`: why a piece of transactional work asked to abort; this is
//!   the error type transactional closures return with `?`
//!
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.

use crate::types::{Phase, TxResult, TxStatus};
use std::io;
use thiserror::Error;

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, RewindError>;

/// Usage errors raised by the transaction runtime
#[derive(Debug, Error)]
pub enum RewindError {
    /// A primitive that needs an active nest was called outside of one
    #[error("No active transaction")]
    NoActiveTransaction,

    /// A transaction record was driven through an illegal state transition
    #[error("Invalid transaction state: {0}")]
    InvalidState(String),

    /// Abort requested after the outermost commit began running on-commit work
    #[error("Abort requested while committing")]
    AbortDuringCommit,

    /// Abort requested from an on-abort handler of a level being rolled back
    #[error("Abort requested while aborting")]
    AbortDuringAbort,

    /// A new transaction was started from an on-commit or on-abort closure
    #[error("Transaction started while {0}")]
    TransactInCallback(Phase),

    /// The per-thread transaction stack failed its consistency check
    #[error("Consistency check failed: {0}")]
    Inconsistent(String),

    /// Invalid argument (out-of-bounds buffer access, bad config value, ...)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration could not be read or parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error (config file access)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RewindError {
    /// Create an `InvalidState` error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        RewindError::InvalidState(msg.into())
    }

    /// Create an `InvalidInput` error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        RewindError::InvalidInput(msg.into())
    }

    /// Whether this error is a structural misuse of the nesting protocol
    ///
    /// Structural misuse is never absorbed: at the C boundary it terminates
    /// the process.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RewindError::NoActiveTransaction
                | RewindError::AbortDuringCommit
                | RewindError::AbortDuringAbort
                | RewindError::TransactInCallback(_)
                | RewindError::Inconsistent(_)
        )
    }
}

/// Why transactional work aborted
///
/// Returned as the error of a transactional closure. The nearest enclosing
/// `transact` call rolls back its level and reports the matching `TxResult`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AbortReason {
    /// The work explicitly asked to abort
    #[error("abort requested")]
    Request,

    /// Something not expressible transactionally was reached
    #[error("language abort: {0}")]
    Language(String),

    /// Abort the whole nest, not just the nearest level
    #[error("cascading abort")]
    Cascade,
}

impl AbortReason {
    /// Create a language abort with a message
    pub fn language(msg: impl Into<String>) -> Self {
        AbortReason::Language(msg.into())
    }

    /// Terminal result reported for this abort
    pub fn result(&self) -> TxResult {
        match self {
            AbortReason::Request => TxResult::AbortedByRequest,
            AbortReason::Language(_) => TxResult::AbortedByLanguage,
            AbortReason::Cascade => TxResult::AbortedByCascade,
        }
    }

    /// Live status while this abort is pending
    pub fn status(&self) -> TxStatus {
        match self {
            AbortReason::Request => TxStatus::AbortedByRequest,
            AbortReason::Language(_) => TxStatus::AbortedByLanguage,
            AbortReason::Cascade => TxStatus::AbortedByCascade,
        }
    }
}

//! Nesting layer for Rewind
//!
//! This crate implements the per-thread transaction machinery:
//! - UndoLog: deduplicated pre-write values, join into parent, replay on abort
//! - CommitQueue / AbortHandlers: deferred callbacks and keyed LIFO handlers
//! - Transaction: one nesting level and its Idle/Started/Committed/Aborted lifecycle
//! - TransactionStack: the chain of nested levels plus the execution mode switch
//!
//! Nothing here is thread-aware: a `TransactionStack` belongs to exactly one
//! thread and is driven synchronously by it.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod callbacks;
pub mod stack;
pub mod transaction;
pub mod undo_log;

pub use callbacks::{AbortHandlers, Callback, CommitQueue};
pub use stack::{Resolution, TransactionStack};
pub use transaction::{StartDisposition, Transaction, TransactionState};
pub use undo_log::{LogEntry, UndoLog};

#[cfg(test)]
mod test_support;

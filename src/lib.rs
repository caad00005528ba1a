//! Rewind - nested speculative execution with undo-log rollback
//!
//! Run a closure as a transaction; every tracked write it makes is logged so
//! that an abort can put memory back exactly as it was. Transactions nest,
//! and an inner commit only becomes final when the outermost level commits.
//!
//! # Quick Start
//!
//! ```
//! use rewind::{AbortReason, Runtime, Speculative, TxCell, TxResult};
//!
//! let rt = Speculative::default();
//! let balance = TxCell::new(100);
//!
//! let result = rt.transact(&mut || {
//!     balance.set(40);
//!     Err(AbortReason::Request)
//! });
//!
//! assert_eq!(result, TxResult::AbortedByRequest);
//! assert_eq!(balance.get(), 100);
//! ```
//!
//! # Architecture
//!
//! - `rewind-core`: identities, modes, outcomes, slots and errors
//! - `rewind-concurrency`: undo logs, callback queues and the per-thread stack
//! - `rewind-engine`: the thread-bound runtime, transactional memory and locks
//! - `rewind-abi`: the C boundary, built as a separate library

pub use rewind_engine::*;

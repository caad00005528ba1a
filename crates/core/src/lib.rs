//! Core types for Rewind
//!
//! This crate defines the foundational types shared by every layer:
//! - TxnId / HandlerKey: identities for nesting levels and keyed abort handlers
//! - ExecMode / Phase: the tracked/untracked execution mode switch
//! - TxResult / TxStatus: terminal result and live status, stable integer values
//! - SlotRef / SlotKey / OldValue: what a log entry restores, and where
//! - Error: RewindError for usage errors, AbortReason for work-level aborts

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod slot;
pub mod types;

pub use error::{AbortReason, Result, RewindError};
pub use slot::{ByteSlots, CellSlot, HostSlot, OldValue, Owner, SlotKey, SlotRef};
pub use types::{ExecMode, HandlerKey, Phase, TxResult, TxStatus, TxnId};

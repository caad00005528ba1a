//! Runtime for Rewind
//!
//! This crate ties the nesting layer to the calling thread and exposes it:
//! - Context: the thread-scoped transaction stack
//! - Runtime: the transactional capability (speculative or pass-through)
//! - Memory: transactional cells and byte buffers that log their own writes
//! - Sync: a mutex whose release is deferred to the end of the nest
//! - Scope guards, the replacement function registry, configuration, metrics
//!
//! The runtime is the only component that knows about threads. Everything
//! below it is driven synchronously by one thread at a time.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod context;
pub mod functions;
pub mod memory;
pub mod metrics;
pub mod runtime;
pub mod scope;
pub mod sync;

pub use config::{RetryPolicy, RuntimeConfig, CONFIG_ENV_VAR, CONFIG_FILE_NAME};
pub use functions::FunctionRegistry;
pub use memory::{TxBuffer, TxCell};
pub use metrics::TransactionMetrics;
pub use runtime::{
    runtime_from_config, Outcome, PassThrough, Runtime, RuntimeExt, Speculative, WorkResult,
};
pub use scope::{AbortHandlerScope, NestedTransaction};
pub use sync::{TxMutex, TxMutexGuard};

pub use rewind_concurrency::{Callback, Transaction};
pub use rewind_core::{
    AbortReason, ExecMode, HandlerKey, HostSlot, Owner, Phase, Result, RewindError, SlotRef,
    TxResult, TxStatus, TxnId,
};

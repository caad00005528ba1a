//! Thread-scoped transaction context
//!
//! Each thread owns one `TransactionStack` in a thread-local slot. The slot is
//! borrowed only for the duration of a single primitive; user work and
//! callbacks always run with the borrow released, so they may call back into
//! the runtime freely.
//!
//! # Architecture
//!
//! - No synchronization: a nest and all of its levels are driven by one thread
//! - Slot capture and restore run under the borrow and must not re-enter the
//!   runtime (cells and buffers only take their own lock)

use rewind_concurrency::{Callback, TransactionStack};
use rewind_core::SlotRef;
use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// This thread's nest of transactions
    static STACK: RefCell<TransactionStack> = RefCell::new(TransactionStack::new());

    /// Lazily assigned nonzero token identifying this thread
    static THREAD_TOKEN: Cell<u64> = const { Cell::new(0) };
}

/// Run `f` against this thread's transaction stack
///
/// # Panics
///
/// Panics if called re-entrantly from inside another `with_stack` closure.
pub fn with_stack<R>(f: impl FnOnce(&mut TransactionStack) -> R) -> R {
    STACK.with(|stack| f(&mut stack.borrow_mut()))
}

/// Whether tracked code is running on this thread
pub fn is_tracked() -> bool {
    with_stack(|stack| stack.is_tracked())
}

/// Whether any nesting level is active on this thread
pub fn is_transactional() -> bool {
    with_stack(|stack| stack.is_transactional())
}

/// Log a slot into the current level before it is written
///
/// `make` is only called when tracked code is running, so untracked writes pay
/// for nothing but the mode check.
pub fn record_write(make: impl FnOnce() -> SlotRef) -> bool {
    with_stack(|stack| {
        if stack.is_tracked() {
            stack.record_write(make())
        } else {
            false
        }
    })
}

/// Defer `task` to the outermost commit, or run it now outside tracked code
pub fn on_commit(task: Callback) {
    if let Some(task) = with_stack(|stack| stack.on_commit(task)) {
        task();
    }
}

/// Run `task` if the nest aborts; dropped outside tracked code
pub fn on_abort(task: Callback) -> bool {
    with_stack(|stack| stack.on_abort(task))
}

/// Nonzero identifier of the calling thread, stable for its lifetime
pub fn thread_token() -> u64 {
    THREAD_TOKEN.with(|token| {
        let current = token.get();
        if current != 0 {
            return current;
        }
        let assigned = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
        token.set(assigned);
        assigned
    })
}

//! Transactional mutex
//!
//! Holding a lock is an externally visible effect, so tracked code must not
//! reveal it and then retract it. The first tracked acquisition in a nest takes
//! the real lock and keeps it until the nest resolves:
//!
//! - an on-commit closure releases it after the outermost commit
//! - an on-abort closure clears the nest's bookkeeping and releases it if the
//!   nest aborts
//!
//! Exactly one of the two runs. Further acquisitions by the same nest only
//! bump a count. Outside tracked code the mutex is an ordinary mutex whose
//! guard unlocks on drop.
//!
//! The guard hands out shared access only. State behind the lock that must be
//! rolled back lives in transactional cells.

use crate::context;
use parking_lot::lock_api::RawMutex as _;
use parking_lot::RawMutex;
use std::cell::UnsafeCell;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Mutex whose release is deferred to the end of the owning nest
pub struct TxMutex<T> {
    raw: RawMutex,
    /// Thread token of the nest holding the lock, 0 if none
    nest_owner: AtomicU64,
    /// Acquisitions made by that nest
    nest_holds: AtomicUsize,
    data: UnsafeCell<T>,
}

// SAFETY: guards only hand out shared references, and sharing across threads
// requires `T: Sync`.
unsafe impl<T: Send> Send for TxMutex<T> {}
unsafe impl<T: Send + Sync> Sync for TxMutex<T> {}

impl<T: Send + Sync + 'static> TxMutex<T> {
    /// Create an unlocked mutex
    pub fn new(value: T) -> Arc<Self> {
        Arc::new(Self {
            raw: RawMutex::INIT,
            nest_owner: AtomicU64::new(0),
            nest_holds: AtomicUsize::new(0),
            data: UnsafeCell::new(value),
        })
    }

    /// Acquire the lock
    ///
    /// In tracked code the real lock stays held until the nest commits or
    /// aborts, whatever happens to the guard. Acquiring a lock the calling
    /// thread already holds outside a nest deadlocks, as with any mutex.
    pub fn lock(self: &Arc<Self>) -> TxMutexGuard<'_, T> {
        let token = context::thread_token();
        if self.nest_owner.load(Ordering::Acquire) == token {
            let holds = self.nest_holds.fetch_add(1, Ordering::Relaxed) + 1;
            trace!(target: "rewind::txn", holds, "Transactional lock re-acquired by nest");
            return TxMutexGuard {
                mutex: self,
                unlock_on_drop: false,
            };
        }

        if !context::is_tracked() {
            self.raw.lock();
            return TxMutexGuard {
                mutex: self,
                unlock_on_drop: true,
            };
        }

        self.raw.lock();
        self.nest_holds.store(1, Ordering::Relaxed);
        self.nest_owner.store(token, Ordering::Release);
        trace!(target: "rewind::txn", "Transactional lock acquired by nest");

        let on_commit = Arc::clone(self);
        context::on_commit(Box::new(move || on_commit.release_nest()));
        let on_abort = Arc::clone(self);
        context::on_abort(Box::new(move || on_abort.release_nest()));

        TxMutexGuard {
            mutex: self,
            unlock_on_drop: false,
        }
    }

    /// Whether any thread holds the real lock
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    /// Acquisitions made by the nest currently holding the lock
    pub fn nest_holds(&self) -> usize {
        self.nest_holds.load(Ordering::Relaxed)
    }

    fn release_nest(&self) {
        let holds = self.nest_holds.swap(0, Ordering::Relaxed);
        self.nest_owner.store(0, Ordering::Release);
        trace!(target: "rewind::txn", holds, "Transactional lock released by nest");
        // SAFETY: the nest took the lock in `lock` and this closure is the
        // single release registered for it.
        unsafe { self.raw.unlock() };
    }
}

impl<T: fmt::Debug> fmt::Debug for TxMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxMutex")
            .field("locked", &self.raw.is_locked())
            .field("nest_holds", &self.nest_holds.load(Ordering::Relaxed))
            .finish()
    }
}

/// Shared access to the data behind a `TxMutex`
#[must_use = "if unused the mutex is released immediately outside a transaction"]
pub struct TxMutexGuard<'a, T> {
    mutex: &'a TxMutex<T>,
    unlock_on_drop: bool,
}

impl<T> Deref for TxMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the lock is held for as long as this guard exists.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> Drop for TxMutexGuard<'_, T> {
    fn drop(&mut self) {
        if self.unlock_on_drop {
            // SAFETY: this guard took the lock in `lock`.
            unsafe { self.mutex.raw.unlock() };
        }
    }
}

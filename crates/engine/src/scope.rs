//! Scope guards over the runtime
//!
//! - `AbortHandlerScope`: installs a keyed on-abort handler for the extent of
//!   a mutating scope. `exit` pops it; leaving the scope any other way (an
//!   abort carried out by `?`, a panic) leaves it installed so it fires.
//! - `NestedTransaction`: a manually opened nesting level. It must be
//!   resolved with `commit` or `abort`; dropping it unresolved aborts it.

use crate::runtime::Runtime;
use rewind_core::{AbortReason, HandlerKey, Result, RewindError, TxResult, TxnId};
use tracing::warn;

/// Keyed on-abort handler bound to a scope
#[must_use = "the handler is only popped by calling `exit`"]
pub struct AbortHandlerScope<'r> {
    runtime: &'r dyn Runtime,
    key: HandlerKey,
}

impl<'r> AbortHandlerScope<'r> {
    /// Install `handler` under `key`
    pub fn enter(
        runtime: &'r dyn Runtime,
        key: HandlerKey,
        handler: impl FnOnce() + 'static,
    ) -> Self {
        runtime.push_on_abort_handler(key, Box::new(handler));
        Self { runtime, key }
    }

    /// Key the handler was installed under
    pub fn key(&self) -> HandlerKey {
        self.key
    }

    /// Leave the scope normally; the handler will not fire
    pub fn exit(self) -> bool {
        self.runtime.pop_on_abort_handler(self.key)
    }
}

/// A nesting level opened with `start_transaction`
#[must_use = "an unresolved nested transaction aborts when dropped"]
pub struct NestedTransaction<'r> {
    runtime: &'r dyn Runtime,
    id: TxnId,
    resolved: bool,
}

impl<'r> NestedTransaction<'r> {
    /// Open a level inside the active nest
    pub fn begin(runtime: &'r dyn Runtime) -> Result<Self> {
        let id = runtime.start_transaction()?;
        Ok(Self {
            runtime,
            id,
            resolved: false,
        })
    }

    /// Id of the level
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Commit the level into its parent
    pub fn commit(mut self) -> Result<TxResult> {
        self.ensure_current()?;
        self.resolved = true;
        self.runtime.commit_transaction()
    }

    /// Roll the level back
    pub fn abort(mut self, reason: AbortReason) -> Result<TxResult> {
        self.ensure_current()?;
        self.resolved = true;
        self.runtime.abort_transaction(reason)
    }

    fn ensure_current(&self) -> Result<()> {
        match self.runtime.current_transaction() {
            Some(id) if id == self.id => Ok(()),
            other => Err(RewindError::invalid_state(format!(
                "{} is not the current level (current: {:?})",
                self.id, other
            ))),
        }
    }
}

impl Drop for NestedTransaction<'_> {
    fn drop(&mut self) {
        if self.resolved || self.ensure_current().is_err() {
            return;
        }
        warn!(target: "rewind::txn", txn_id = %self.id, "Nested transaction dropped unresolved; aborting");
        if let Err(e) = self.runtime.abort_transaction(AbortReason::Request) {
            warn!(target: "rewind::txn", txn_id = %self.id, error = %e, "Abort of dropped nested transaction failed");
        }
    }
}

//! Per-thread chain of nested transactions
//!
//! `TransactionStack` is the explicit context object for one thread: the
//! innermost level is "current", nesting is the parent chain, and the stack
//! carries the execution mode switch and any pending abort.
//!
//! Resolving a level (commit or abort) never runs user callbacks while the
//! stack is borrowed. Instead it returns a `Resolution` holding the closures
//! to run and the mode to restore; the caller runs the closures with the mode
//! set to `CommittingOrAborting`, then calls `finish`.
//!
//! ## Pending aborts
//!
//! An abort requested by the current code (abort-current) is recorded as
//! pending against the level that was current at the time, and only that
//! level's boundary carries it out. Levels nested after the request commit
//! normally. A cascading abort is handed on to the parent each time its level
//! aborts, dooming every ancestor until the outermost level has aborted.

use crate::callbacks::Callback;
use crate::transaction::{StartDisposition, Transaction};
use rewind_core::{
    AbortReason, ExecMode, HandlerKey, Owner, Phase, Result, RewindError, SlotRef, TxResult,
    TxStatus, TxnId,
};
use std::fmt;
use tracing::debug;

/// Outcome of resolving one level
pub struct Resolution {
    /// Id of the resolved level
    pub id: TxnId,
    /// How the level ended
    pub result: TxResult,
    /// Closures to run now (on-commit work or on-abort handlers), in order
    pub callbacks: Vec<Callback>,
    /// Mode to restore once the callbacks have run
    pub restore_mode: ExecMode,
    /// Nesting depth after the level was popped
    pub depth: usize,
}

impl fmt::Debug for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolution")
            .field("id", &self.id)
            .field("result", &self.result)
            .field("callbacks", &self.callbacks.len())
            .field("restore_mode", &self.restore_mode)
            .field("depth", &self.depth)
            .finish()
    }
}

/// Nested transactions of one thread
#[derive(Debug, Default)]
pub struct TransactionStack {
    levels: Vec<Transaction>,
    mode: ExecMode,
    /// Pending aborts and the level each targets, innermost last
    pending: Vec<(TxnId, AbortReason)>,
}

impl TransactionStack {
    /// Create an empty stack
    pub fn new() -> Self {
        Self::default()
    }

    // === Queries ===

    /// Number of active nesting levels
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// Current execution mode
    pub fn mode(&self) -> ExecMode {
        self.mode
    }

    /// The innermost level
    pub fn current(&self) -> Option<&Transaction> {
        self.levels.last()
    }

    /// Whether writes must be logged right now
    pub fn is_tracked(&self) -> bool {
        self.mode.is_tracked() && !self.levels.is_empty()
    }

    /// Whether any nesting level is active
    pub fn is_transactional(&self) -> bool {
        !self.levels.is_empty()
    }

    /// Whether a level is running its commit or abort callbacks
    pub fn is_committing_or_aborting(&self) -> bool {
        self.mode.is_committing_or_aborting()
    }

    /// Abort pending against the current level, if any
    pub fn pending(&self) -> Option<&AbortReason> {
        let current = self.levels.last()?.id();
        match self.pending.last() {
            Some((target, reason)) if *target == current => Some(reason),
            _ => None,
        }
    }

    /// Live status
    ///
    /// Reports the innermost pending abort, even when it targets an ancestor
    /// of the current level.
    pub fn status(&self) -> TxStatus {
        if let Some((_, reason)) = self.pending.last() {
            return reason.status();
        }
        match self.mode {
            ExecMode::CommittingOrAborting(Phase::Commit) => TxStatus::Committing,
            _ if self.levels.is_empty() => TxStatus::Idle,
            _ => TxStatus::OnTrack,
        }
    }

    // === Mode switch ===

    /// Switch mode, returning the previous one
    ///
    /// Only `Tracked` and `Untracked` may be requested, and only inside a nest.
    pub fn set_mode(&mut self, mode: ExecMode) -> Result<ExecMode> {
        match mode {
            ExecMode::Tracked | ExecMode::Untracked if self.is_transactional() => {
                Ok(std::mem::replace(&mut self.mode, mode))
            }
            ExecMode::Tracked | ExecMode::Untracked => Err(RewindError::NoActiveTransaction),
            other => Err(RewindError::invalid_state(format!(
                "mode {:?} cannot be requested directly",
                other
            ))),
        }
    }

    /// Restore the mode saved by `set_mode` or carried by a `Resolution`
    pub fn finish(&mut self, mode: ExecMode) {
        self.mode = mode;
    }

    // === Lifecycle ===

    /// Start `txn` as the new current level
    ///
    /// Fails with `TransactInCallback` while a commit or abort is running its
    /// callbacks: starting a nest there would break the single-current
    /// invariant.
    pub fn start(&mut self, mut txn: Transaction) -> Result<StartDisposition> {
        if let ExecMode::CommittingOrAborting(phase) = self.mode {
            return Err(RewindError::TransactInCallback(phase));
        }
        let parent = self.levels.last().map(Transaction::id);
        let disposition = txn.start(parent, self.mode)?;
        if disposition == StartDisposition::Started {
            debug!(target: "rewind::txn", txn_id = %txn.id(), depth = self.levels.len() + 1, "Transaction started");
            self.levels.push(txn);
            self.mode = ExecMode::Tracked;
        } else {
            debug!(target: "rewind::txn", txn_id = %txn.id(), "Transaction aborted before start; body skipped");
        }
        Ok(disposition)
    }

    /// Start a fresh level
    pub fn begin(&mut self) -> Result<TxnId> {
        let txn = Transaction::new();
        let id = txn.id();
        self.start(txn)?;
        Ok(id)
    }

    /// Open an extra manual level inside the active nest
    pub fn start_nested(&mut self) -> Result<TxnId> {
        if self.levels.is_empty() {
            return Err(RewindError::NoActiveTransaction);
        }
        let txn = Transaction::manual();
        let id = txn.id();
        self.start(txn)?;
        Ok(id)
    }

    /// Commit the current level
    ///
    /// If an abort is pending against this level it is aborted instead. A nested level is
    /// joined into its parent and its callbacks move with it; the outermost
    /// level hands back its on-commit closures.
    pub fn commit(&mut self) -> Result<Resolution> {
        if let Some(reason) = self.pending().cloned() {
            return self.abort(reason);
        }
        if self.mode.is_committing_or_aborting() {
            return Err(RewindError::invalid_state(
                "commit requested from a commit or abort callback",
            ));
        }
        let mut txn = self.levels.pop().ok_or(RewindError::NoActiveTransaction)?;
        let restore_mode = txn.entry_mode();

        let callbacks = match self.levels.last_mut() {
            Some(parent) => {
                let kept = match txn.commit_into(parent) {
                    Ok(kept) => kept,
                    Err(e) => {
                        self.levels.push(txn);
                        return Err(e);
                    }
                };
                debug!(target: "rewind::txn", txn_id = %txn.id(), kept, depth = self.levels.len(), "Transaction joined parent");
                self.mode = restore_mode;
                Vec::new()
            }
            None => {
                let entries = txn.log().len();
                let callbacks = match txn.commit() {
                    Ok(callbacks) => callbacks,
                    Err(e) => {
                        self.levels.push(txn);
                        return Err(e);
                    }
                };
                debug!(target: "rewind::txn", txn_id = %txn.id(), entries, callbacks = callbacks.len(), "Transaction committed");
                self.mode = ExecMode::CommittingOrAborting(Phase::Commit);
                callbacks
            }
        };

        Ok(Resolution {
            id: txn.id(),
            result: TxResult::Committed,
            callbacks,
            restore_mode,
            depth: self.levels.len(),
        })
    }

    /// Abort the current level
    ///
    /// Replays its log, drops its on-commit work and hands back its on-abort
    /// handlers. Rejected while on-commit closures or on-abort handlers run.
    pub fn abort(&mut self, reason: AbortReason) -> Result<Resolution> {
        match self.mode {
            ExecMode::CommittingOrAborting(Phase::Commit) => {
                return Err(RewindError::AbortDuringCommit)
            }
            ExecMode::CommittingOrAborting(Phase::Abort) => {
                return Err(RewindError::AbortDuringAbort)
            }
            _ => {}
        }
        let mut txn = self.levels.pop().ok_or(RewindError::NoActiveTransaction)?;
        let restore_mode = txn.entry_mode();
        let entries = txn.log().len();
        let callbacks = match txn.abort() {
            Ok(callbacks) => callbacks,
            Err(e) => {
                self.levels.push(txn);
                return Err(e);
            }
        };

        let owns_pending = matches!(self.pending.last(), Some((target, _)) if *target == txn.id());
        let own = if owns_pending {
            self.pending.pop().map(|(_, r)| r)
        } else {
            None
        };
        // A cascade outlives any level it passes through
        if reason == AbortReason::Cascade || own == Some(AbortReason::Cascade) {
            if let Some(parent) = self.levels.last().map(Transaction::id) {
                self.target_pending(parent, AbortReason::Cascade);
            }
        }
        debug!(target: "rewind::txn", txn_id = %txn.id(), entries, reason = %reason, depth = self.levels.len(), "Transaction aborted");
        self.mode = ExecMode::CommittingOrAborting(Phase::Abort);

        Ok(Resolution {
            id: txn.id(),
            result: reason.result(),
            callbacks,
            restore_mode,
            depth: self.levels.len(),
        })
    }

    /// Record an abort for the current level's boundary to carry out
    ///
    /// Rejected while either callback phase runs: the level those callbacks
    /// belong to has already been resolved.
    pub fn request_abort(&mut self, reason: AbortReason) -> Result<()> {
        match self.mode {
            ExecMode::CommittingOrAborting(Phase::Commit) => {
                return Err(RewindError::AbortDuringCommit)
            }
            ExecMode::CommittingOrAborting(Phase::Abort) => {
                return Err(RewindError::AbortDuringAbort)
            }
            _ => {}
        }
        let current = self
            .levels
            .last()
            .map(Transaction::id)
            .ok_or(RewindError::NoActiveTransaction)?;
        self.target_pending(current, reason);
        Ok(())
    }

    /// Set the abort pending against `target`, which must be the current or
    /// the innermost doomed level; a pending cascade is never downgraded
    fn target_pending(&mut self, target: TxnId, reason: AbortReason) {
        if let Some((id, pending)) = self.pending.last_mut() {
            if *id == target {
                if *pending != AbortReason::Cascade {
                    *pending = reason;
                }
                return;
            }
        }
        self.pending.push((target, reason));
    }

    /// Forget every pending abort
    pub fn clear_status(&mut self) {
        self.pending.clear();
    }

    // === Recording ===

    /// Log the slot's current contents into the current level
    ///
    /// No-op (returns false) unless tracked code is running.
    pub fn record_write(&mut self, slot: SlotRef) -> bool {
        if !self.mode.is_tracked() {
            return false;
        }
        match self.levels.last_mut() {
            Some(txn) => txn.record_write(slot).unwrap_or(false),
            None => false,
        }
    }

    /// Keep `owner` alive until the current level resolves
    pub fn add_root(&mut self, owner: Owner) -> bool {
        if !self.mode.is_tracked() {
            return false;
        }
        match self.levels.last_mut() {
            Some(txn) => txn.add_root(owner).is_ok(),
            None => false,
        }
    }

    /// Defer `task` to the outermost commit
    ///
    /// Outside tracked code there is nothing to defer to, and the task is
    /// handed back for the caller to run immediately.
    pub fn on_commit(&mut self, task: Callback) -> Option<Callback> {
        if !self.mode.is_tracked() {
            return Some(task);
        }
        match self.levels.last_mut() {
            Some(txn) => txn.on_commit(task).err(),
            None => Some(task),
        }
    }

    /// Run `task` if the nest aborts; dropped outside tracked code
    pub fn on_abort(&mut self, task: Callback) -> bool {
        if !self.mode.is_tracked() {
            return false;
        }
        self.levels
            .last_mut()
            .map(|txn| txn.on_abort(task).is_ok())
            .unwrap_or(false)
    }

    /// Install a keyed on-abort handler; dropped outside tracked code
    pub fn push_on_abort_handler(&mut self, key: HandlerKey, task: Callback) -> bool {
        if !self.mode.is_tracked() {
            return false;
        }
        self.levels
            .last_mut()
            .map(|txn| txn.push_on_abort_handler(key, task).is_ok())
            .unwrap_or(false)
    }

    /// Remove the most recent handler for `key`; no-op outside tracked code
    pub fn pop_on_abort_handler(&mut self, key: HandlerKey) -> bool {
        if !self.mode.is_tracked() {
            return false;
        }
        self.levels
            .last_mut()
            .and_then(|txn| txn.pop_on_abort_handler(key).ok())
            .unwrap_or(false)
    }

    /// Remove every handler for `key`; no-op outside tracked code
    pub fn pop_all_on_abort_handlers(&mut self, key: HandlerKey) -> usize {
        if !self.mode.is_tracked() {
            return 0;
        }
        self.levels
            .last_mut()
            .and_then(|txn| txn.pop_all_on_abort_handlers(key).ok())
            .unwrap_or(0)
    }

    // === Consistency ===

    /// Verify the structural invariants of the stack
    ///
    /// - mode is `NotTransactional` exactly when no level is active
    ///   (outside of callback phases)
    /// - every level is started, and its parent link names the level below it
    /// - every log's seen set agrees with its entries
    /// - every pending abort targets an active level, at most one per level,
    ///   innermost last
    pub fn consistency_check(&self) -> Result<()> {
        match (self.mode, self.levels.is_empty()) {
            (ExecMode::NotTransactional, false) => {
                return Err(RewindError::Inconsistent(format!(
                    "{} levels active but mode is NotTransactional",
                    self.levels.len()
                )))
            }
            (ExecMode::Tracked | ExecMode::Untracked, true) => {
                return Err(RewindError::Inconsistent(format!(
                    "mode is {:?} but no level is active",
                    self.mode
                )))
            }
            _ => {}
        }

        let mut expected_parent = None;
        for txn in &self.levels {
            if !txn.is_started() {
                return Err(RewindError::Inconsistent(format!(
                    "{} is on the stack in state {:?}",
                    txn.id(),
                    txn.state()
                )));
            }
            if txn.parent() != expected_parent {
                return Err(RewindError::Inconsistent(format!(
                    "{} links to parent {:?}, expected {:?}",
                    txn.id(),
                    txn.parent(),
                    expected_parent
                )));
            }
            if !txn.log().is_consistent() {
                return Err(RewindError::Inconsistent(format!(
                    "{} has an undo log whose seen set disagrees with its entries",
                    txn.id()
                )));
            }
            expected_parent = Some(txn.id());
        }

        let mut active = self.levels.iter().map(Transaction::id);
        for (target, reason) in &self.pending {
            if !active.any(|id| id == *target) {
                return Err(RewindError::Inconsistent(format!(
                    "abort ({}) pending against {}, which is not an active level in nesting order",
                    reason, target
                )));
            }
        }
        Ok(())
    }
}

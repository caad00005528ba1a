//! One nesting level
//!
//! A `Transaction` owns everything a level accumulates: its undo log, its
//! on-commit queue and its on-abort handlers. It carries a weak parent link
//! (the parent's id) rather than a reference; the stack owns all levels.
//!
//! State transitions:
//! - `Idle` → `Started` (start)
//! - `Started` → `Committed` (commit, or join into parent)
//! - `Started` → `Aborted` (abort: replay log, hand back handlers)
//! - `Idle` → `Aborted` (abort before start: no log or handler work)
//!
//! Terminal states (no transitions allowed):
//! - `Committed`
//! - `Aborted`
//!
//! Starting an `Aborted` transaction is legal and is a no-op: the pending
//! abort decision resolved before the block's body began, so the body is
//! skipped entirely.

use crate::callbacks::{AbortHandlers, Callback, CommitQueue};
use crate::undo_log::UndoLog;
use rewind_core::{ExecMode, HandlerKey, Owner, Result, RewindError, SlotRef, TxnId};

/// Lifecycle state of a nesting level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Created, not yet started
    Idle,
    /// Running; writes are logged into this level
    Started,
    /// Committed or joined into its parent
    Committed,
    /// Rolled back (or aborted before it started)
    Aborted,
}

/// What `start` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartDisposition {
    /// The level is now running
    Started,
    /// The level was aborted before start; nothing ran
    SkippedAborted,
}

/// One nesting level
#[derive(Debug)]
pub struct Transaction {
    id: TxnId,
    parent: Option<TxnId>,
    state: TransactionState,
    entry_mode: ExecMode,
    manual: bool,
    log: UndoLog,
    on_commit: CommitQueue,
    on_abort: AbortHandlers,
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Transaction {
    /// Create an idle transaction with a fresh id
    pub fn new() -> Self {
        Self {
            id: TxnId::next(),
            parent: None,
            state: TransactionState::Idle,
            entry_mode: ExecMode::NotTransactional,
            manual: false,
            log: UndoLog::new(),
            on_commit: CommitQueue::new(),
            on_abort: AbortHandlers::new(),
        }
    }

    /// Create an idle transaction for a manually opened nesting level
    pub fn manual() -> Self {
        Self {
            manual: true,
            ..Self::new()
        }
    }

    // === Accessors ===

    /// Unique id of this level
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Id of the enclosing level, if any
    pub fn parent(&self) -> Option<TxnId> {
        self.parent
    }

    /// Current lifecycle state
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Mode that was active when this level started; restored when it resolves
    pub fn entry_mode(&self) -> ExecMode {
        self.entry_mode
    }

    /// Whether this level was opened with the manual start primitive
    pub fn is_manual(&self) -> bool {
        self.manual
    }

    /// This level's undo log
    pub fn log(&self) -> &UndoLog {
        &self.log
    }

    /// Number of pending on-commit closures
    pub fn commit_task_count(&self) -> usize {
        self.on_commit.len()
    }

    /// Number of installed on-abort closures and handlers
    pub fn abort_handler_count(&self) -> usize {
        self.on_abort.len()
    }

    /// Check if transaction is running
    pub fn is_started(&self) -> bool {
        self.state == TransactionState::Started
    }

    /// Check if transaction is committed
    pub fn is_committed(&self) -> bool {
        self.state == TransactionState::Committed
    }

    /// Check if transaction is aborted
    pub fn is_aborted(&self) -> bool {
        self.state == TransactionState::Aborted
    }

    fn ensure_started(&self, op: &str) -> Result<()> {
        match self.state {
            TransactionState::Started => Ok(()),
            state => Err(RewindError::invalid_state(format!(
                "cannot {} {}: transaction is {:?}",
                op, self.id, state
            ))),
        }
    }

    /// Check that nothing was ever recorded into this level
    fn verify_pristine(&self) -> Result<()> {
        if self.log.is_empty() && self.on_commit.is_empty() && self.on_abort.is_empty() {
            Ok(())
        } else {
            Err(RewindError::Inconsistent(format!(
                "{} was aborted before start but owns {} log entries, {} commit tasks, {} abort handlers",
                self.id,
                self.log.len(),
                self.on_commit.len(),
                self.on_abort.len()
            )))
        }
    }

    // === Lifecycle ===

    /// Start this level under `parent`
    ///
    /// Requires `Idle`, or `Aborted` (abort before start), in which case the
    /// start is skipped after checking the level never accumulated any work.
    pub fn start(&mut self, parent: Option<TxnId>, entry_mode: ExecMode) -> Result<StartDisposition> {
        match self.state {
            TransactionState::Idle => {
                self.parent = parent;
                self.entry_mode = entry_mode;
                self.state = TransactionState::Started;
                Ok(StartDisposition::Started)
            }
            TransactionState::Aborted => {
                self.verify_pristine()?;
                Ok(StartDisposition::SkippedAborted)
            }
            state => Err(RewindError::invalid_state(format!(
                "cannot start {}: transaction is {:?}",
                self.id, state
            ))),
        }
    }

    /// Commit this level into its parent (Join)
    ///
    /// The parent's seen set decides which offered log entries survive, so the
    /// first writer to a slot across the whole nest wins.
    pub fn commit_into(&mut self, parent: &mut Transaction) -> Result<usize> {
        self.ensure_started("commit")?;
        parent.ensure_started("join into")?;
        if self.parent != Some(parent.id) {
            return Err(RewindError::Inconsistent(format!(
                "{} joined into {} but its parent is {:?}",
                self.id, parent.id, self.parent
            )));
        }
        let kept = parent.log.join(std::mem::take(&mut self.log));
        parent.on_commit.join(std::mem::take(&mut self.on_commit));
        parent.on_abort.join(std::mem::take(&mut self.on_abort));
        self.state = TransactionState::Committed;
        Ok(kept)
    }

    /// Commit the outermost level
    ///
    /// Returns the accumulated on-commit closures, in registration order; the
    /// caller runs them once it no longer holds the stack.
    pub fn commit(&mut self) -> Result<Vec<Callback>> {
        self.ensure_started("commit")?;
        if self.parent.is_some() {
            return Err(RewindError::invalid_state(format!(
                "{} has a parent and must be joined, not finalized",
                self.id
            )));
        }
        self.log.clear();
        drop(std::mem::take(&mut self.on_abort));
        self.state = TransactionState::Committed;
        Ok(std::mem::take(&mut self.on_commit).into_tasks())
    }

    /// Abort this level
    ///
    /// If started: replay the log, discard on-commit work, and return the
    /// on-abort handlers newest first. If idle: mark aborted with no log or
    /// handler work.
    pub fn abort(&mut self) -> Result<Vec<Callback>> {
        match self.state {
            TransactionState::Started => {
                self.log.abort();
                drop(std::mem::take(&mut self.on_commit));
                self.state = TransactionState::Aborted;
                Ok(std::mem::take(&mut self.on_abort).into_tasks())
            }
            TransactionState::Idle => {
                self.verify_pristine()?;
                self.state = TransactionState::Aborted;
                Ok(Vec::new())
            }
            state => Err(RewindError::invalid_state(format!(
                "cannot abort {}: transaction is {:?}",
                self.id, state
            ))),
        }
    }

    // === Recording ===

    /// Record the pre-write contents of `slot`
    pub fn record_write(&mut self, slot: SlotRef) -> Result<bool> {
        self.ensure_started("record a write in")?;
        Ok(self.log.record(slot))
    }

    /// Keep `owner` alive until this level resolves
    pub fn add_root(&mut self, owner: Owner) -> Result<()> {
        self.ensure_started("add a root to")?;
        self.log.add_root(owner);
        Ok(())
    }

    /// Defer `task` until the outermost commit
    ///
    /// A level that is not started hands `task` back untouched.
    pub fn on_commit(&mut self, task: Callback) -> std::result::Result<(), Callback> {
        if !self.is_started() {
            return Err(task);
        }
        self.on_commit.push(task);
        Ok(())
    }

    /// Run `task` if this level or any ancestor aborts
    pub fn on_abort(&mut self, task: Callback) -> Result<()> {
        self.ensure_started("register on-abort work in")?;
        self.on_abort.push_unkeyed(task);
        Ok(())
    }

    /// Install a keyed on-abort handler
    pub fn push_on_abort_handler(&mut self, key: HandlerKey, task: Callback) -> Result<()> {
        self.ensure_started("push an abort handler in")?;
        self.on_abort.push(key, task);
        Ok(())
    }

    /// Remove the most recent handler for `key`
    pub fn pop_on_abort_handler(&mut self, key: HandlerKey) -> Result<bool> {
        self.ensure_started("pop an abort handler in")?;
        Ok(self.on_abort.pop(key))
    }

    /// Remove every handler for `key`
    pub fn pop_all_on_abort_handlers(&mut self, key: HandlerKey) -> Result<usize> {
        self.ensure_started("pop abort handlers in")?;
        Ok(self.on_abort.pop_all(key))
    }
}

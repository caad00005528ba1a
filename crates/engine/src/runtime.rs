//! The transactional runtime capability
//!
//! `Runtime` is the object-safe surface every caller goes through. Two
//! implementations exist and are chosen once, from configuration:
//!
//! - `Speculative`: work runs in a nesting level on the calling thread's
//!   stack; tracked writes are logged and rolled back on abort.
//! - `PassThrough`: work runs directly. Nothing is logged, on-commit work runs
//!   at once, on-abort work is dropped, and aborts are reported but cannot
//!   undo anything.
//!
//! # Unwinding
//!
//! Transactional work is a closure returning `Result<(), AbortReason>`; `?`
//! carries an abort out to the nearest `transact`. An abort requested through
//! `request_abort` is remembered on the stack and honored at that same
//! boundary even if the work then returns `Ok`. A panic rolls the level back
//! and keeps unwinding.
//!
//! # Example
//!
//! ```ignore
//! let rt = runtime_from_config(&RuntimeConfig::default());
//! let balance = TxCell::new(100);
//! let result = rt.transact(&mut || {
//!     balance.set(balance.get() - 30);
//!     if balance.get() < 0 {
//!         return rt.abort_current(AbortReason::Request);
//!     }
//!     Ok(())
//! });
//! assert!(result.is_committed());
//! ```

use crate::config::{RetryPolicy, RuntimeConfig};
use crate::context::{self, with_stack};
use crate::metrics::{MetricsRecorder, TransactionMetrics};
use rewind_concurrency::{Callback, Resolution, StartDisposition, Transaction, TransactionStack};
use rewind_core::{
    AbortReason, ExecMode, HandlerKey, Owner, Phase, Result, RewindError, SlotRef, TxResult,
    TxStatus, TxnId,
};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What transactional work returns
pub type WorkResult = std::result::Result<(), AbortReason>;

/// Transactional execution capability
pub trait Runtime: Send + Sync {
    /// Short name of the implementation
    fn name(&self) -> &'static str;

    /// Run `work` in a new nesting level
    ///
    /// Returns `AbortedByTransactInOnCommit` / `AbortedByTransactInOnAbort`
    /// without running `work` when called from a commit or abort callback.
    fn transact(&self, work: &mut dyn FnMut() -> WorkResult) -> TxResult;

    /// Open a new level, then run `work` untracked inside it
    fn transact_then_untracked(&self, work: &mut dyn FnMut() -> WorkResult) -> TxResult;

    /// Run `work` in a caller-created level
    ///
    /// If `txn` was aborted before it started, `work` is skipped and the
    /// result is `AbortedByRequest`.
    fn transact_pending(&self, txn: Transaction, work: &mut dyn FnMut() -> WorkResult)
        -> TxResult;

    /// Run `work` in a new level; abort the process unless it commits
    fn commit_or_die(&self, work: &mut dyn FnMut() -> WorkResult);

    /// Mark the current level for abort at its boundary
    ///
    /// `AbortReason::Cascade` dooms every ancestor as well. Returns the live
    /// status after the request.
    fn request_abort(&self, reason: AbortReason) -> Result<TxStatus>;

    /// Open an extra level inside the active nest
    fn start_transaction(&self) -> Result<TxnId>;

    /// Close the level opened by `start_transaction`
    fn commit_transaction(&self) -> Result<TxResult>;

    /// Roll back the level opened by `start_transaction`
    fn abort_transaction(&self, reason: AbortReason) -> Result<TxResult>;

    /// Forget a pending abort
    fn clear_status(&self);

    /// Run `work` with tracking off; its writes are never rolled back
    fn run_untracked(&self, work: &mut dyn FnMut());

    /// Run `work` tracked inside the active nest; returns the live status
    fn run_tracked(&self, work: &mut dyn FnMut() -> WorkResult) -> Result<TxStatus>;

    /// Log a slot into the current level; call before writing it
    fn record_write(&self, slot: SlotRef) -> bool;

    /// Run `task` when the outermost level commits, or now if not tracked
    fn on_commit(&self, task: Callback);

    /// Run `task` if the nest aborts; returns false if dropped
    fn on_abort(&self, task: Callback) -> bool;

    /// Install a keyed on-abort handler; returns false if dropped
    fn push_on_abort_handler(&self, key: HandlerKey, task: Callback) -> bool;

    /// Remove the most recent handler for `key`
    fn pop_on_abort_handler(&self, key: HandlerKey) -> bool;

    /// Remove every handler for `key`
    fn pop_all_on_abort_handlers(&self, key: HandlerKey) -> usize;

    /// Keep `owner` alive until the current level resolves
    fn keep_alive(&self, owner: Owner) -> bool;

    /// Whether tracked code is running
    fn is_tracked(&self) -> bool;

    /// Whether any nesting level is active
    fn is_transactional(&self) -> bool;

    /// Whether commit or abort callbacks are running
    fn is_committing_or_aborting(&self) -> bool;

    /// Live status of the calling thread's nest
    fn status(&self) -> TxStatus;

    /// Id of the innermost level
    fn current_transaction(&self) -> Option<TxnId>;

    /// Verify the calling thread's nest
    fn consistency_check(&self) -> Result<()>;

    /// Counter snapshot
    fn metrics(&self) -> TransactionMetrics;
}

/// Result of `RuntimeExt::transact_with`
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    /// The work's value; the level committed
    Committed(T),
    /// How the level ended instead
    Aborted(TxResult),
}

impl<T> Outcome<T> {
    /// Whether the level committed
    pub fn is_committed(&self) -> bool {
        matches!(self, Outcome::Committed(_))
    }

    /// Terminal result
    pub fn result(&self) -> TxResult {
        match self {
            Outcome::Committed(_) => TxResult::Committed,
            Outcome::Aborted(result) => *result,
        }
    }

    /// The committed value, if any
    pub fn committed(self) -> Option<T> {
        match self {
            Outcome::Committed(value) => Some(value),
            Outcome::Aborted(_) => None,
        }
    }
}

/// Generic helpers over any `Runtime`
pub trait RuntimeExt: Runtime {
    /// Run `work` in a new level and hand back its value if it commits
    fn transact_with<T, F>(&self, mut work: F) -> Outcome<T>
    where
        F: FnMut() -> std::result::Result<T, AbortReason>,
    {
        let mut value = None;
        let result = self.transact(&mut || {
            value = Some(work()?);
            Ok(())
        });
        match (result, value) {
            (TxResult::Committed, Some(value)) => Outcome::Committed(value),
            (result, _) => Outcome::Aborted(result),
        }
    }

    /// Request an abort of the current level and return it as an error
    ///
    /// `return rt.abort_current(AbortReason::Request);` leaves the work and
    /// aborts the nearest level even if the caller drops the error. Outside a
    /// nest (or under `PassThrough`) nothing can be rolled back; the reason is
    /// still returned and a warning is logged.
    ///
    /// # Panics
    ///
    /// Panics when called from an on-commit closure or an on-abort handler.
    /// The level those callbacks belong to is already resolved, so the abort
    /// could not be honored.
    fn abort_current<T>(&self, reason: AbortReason) -> std::result::Result<T, AbortReason> {
        match self.request_abort(reason.clone()) {
            Ok(_) => {}
            Err(RewindError::NoActiveTransaction) => {
                warn!(target: "rewind::txn", reason = %reason, "Abort requested outside an active nest; nothing to roll back");
            }
            Err(e) => {
                error!(target: "rewind::txn", error = %e, reason = %reason, "Abort could not be requested");
                panic!("abort_current({}) rejected: {}", reason, e);
            }
        }
        Err(reason)
    }

    /// Run `body` with `handler` installed under `key`
    ///
    /// The handler is popped when `body` returns `Ok`. If `body` aborts, the
    /// handler stays installed and fires with the abort.
    fn with_abort_handler<T, H, B>(
        &self,
        key: HandlerKey,
        handler: H,
        body: B,
    ) -> std::result::Result<T, AbortReason>
    where
        H: FnOnce() + 'static,
        B: FnOnce() -> std::result::Result<T, AbortReason>,
    {
        self.push_on_abort_handler(key, Box::new(handler));
        let value = body()?;
        self.pop_on_abort_handler(key);
        Ok(value)
    }
}

impl<R: Runtime + ?Sized> RuntimeExt for R {}

/// Pick the runtime implementation for `config`
pub fn runtime_from_config(config: &RuntimeConfig) -> Arc<dyn Runtime> {
    let runtime: Arc<dyn Runtime> = if config.enabled {
        Arc::new(Speculative::new(config.clone()))
    } else {
        Arc::new(PassThrough::new())
    };
    info!(target: "rewind::txn", runtime = runtime.name(), retry = ?config.retry, "Runtime selected");
    runtime
}

/// Restores the execution mode when dropped, including during unwinding
struct RestoreMode(ExecMode);

impl Drop for RestoreMode {
    fn drop(&mut self) {
        with_stack(|stack| stack.finish(self.0));
    }
}

fn transact_in_callback(phase: Phase) -> TxResult {
    match phase {
        Phase::Commit => TxResult::AbortedByTransactInOnCommit,
        Phase::Abort => TxResult::AbortedByTransactInOnAbort,
    }
}

// ============================================================================
// Speculative
// ============================================================================

/// Undo-log backed runtime
#[derive(Debug, Default)]
pub struct Speculative {
    config: RuntimeConfig,
    metrics: MetricsRecorder,
}

impl Speculative {
    /// Create a runtime with `config`
    ///
    /// `config.enabled` is not consulted; use `runtime_from_config` to honor it.
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            metrics: MetricsRecorder::new(),
        }
    }

    /// Active configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Start `first`, run `work`, resolve the level
    fn run_level(
        &self,
        first: Transaction,
        body_mode: ExecMode,
        work: &mut dyn FnMut() -> WorkResult,
    ) -> TxResult {
        let mut next = Some(first);
        let mut retried = false;
        loop {
            let txn = next.take().unwrap_or_default();
            let depth = match with_stack(|s| s.start(txn).map(|d| (d, s.depth()))) {
                Ok((StartDisposition::Started, depth)) => depth,
                Ok((StartDisposition::SkippedAborted, _)) => {
                    self.metrics.record_skipped();
                    return TxResult::AbortedByRequest;
                }
                Err(RewindError::TransactInCallback(phase)) => {
                    warn!(target: "rewind::txn", phase = %phase, "Transaction started from a callback; work skipped");
                    self.metrics.record_skipped();
                    return transact_in_callback(phase);
                }
                Err(e) => {
                    error!(target: "rewind::txn", error = %e, "Transaction could not start");
                    self.metrics.record_skipped();
                    return TxResult::AbortedByLanguage;
                }
            };
            self.metrics.record_start();
            if body_mode == ExecMode::Untracked {
                // Cannot fail: the level just started
                let _ = with_stack(|s| s.set_mode(ExecMode::Untracked));
            }

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| work()));
            self.close_unbalanced(depth);
            if with_stack(|s| s.depth()) != depth {
                error!(target: "rewind::txn", depth, "Transaction level vanished before its boundary");
                return TxResult::AbortedByLanguage;
            }

            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(payload) => {
                    self.abort_level(AbortReason::language("panic in transactional work"));
                    panic::resume_unwind(payload);
                }
            };

            let pending = with_stack(|s| s.pending().cloned());
            let resolution = match (pending, outcome) {
                (Some(AbortReason::Cascade), _) => return self.abort_level(AbortReason::Cascade),
                (_, Err(reason)) => return self.abort_level(reason),
                (None, Ok(())) if self.should_retry(depth, retried) => {
                    self.resolve(with_stack(|s| s.abort(AbortReason::Request)));
                    self.metrics.record_retry();
                    retried = true;
                    debug!(target: "rewind::txn", "Outermost transaction rolled back for retry");
                    continue;
                }
                (_, Ok(())) => with_stack(|s| s.commit()),
            };
            return self.resolve(resolution);
        }
    }

    fn should_retry(&self, depth: usize, retried: bool) -> bool {
        self.config.retry == RetryPolicy::AbortAndRetryOutermost && depth == 1 && !retried
    }

    /// Abort levels that work opened with `start_transaction` and left open
    fn close_unbalanced(&self, depth: usize) {
        while with_stack(|s| s.depth()) > depth {
            warn!(target: "rewind::txn", depth, "Manual transaction left open; aborting it");
            let reason = match with_stack(|s| s.pending().cloned()) {
                Some(AbortReason::Cascade) => AbortReason::Cascade,
                _ => AbortReason::language("unbalanced manual transaction"),
            };
            let resolution = with_stack(|s| s.abort(reason));
            let failed = resolution.is_err();
            self.resolve(resolution);
            if failed {
                break;
            }
        }
    }

    fn abort_level(&self, reason: AbortReason) -> TxResult {
        if let AbortReason::Language(message) = &reason {
            warn!(target: "rewind::txn", message = %message, "Language abort");
        }
        self.resolve(with_stack(|s| s.abort(reason)))
    }

    fn resolve(&self, resolution: Result<Resolution>) -> TxResult {
        match resolution {
            Ok(resolution) => self.run_resolution(resolution),
            Err(e) => {
                error!(target: "rewind::txn", error = %e, "Transaction could not be resolved");
                TxResult::AbortedByLanguage
            }
        }
    }

    /// Run a resolved level's callbacks with the stack released
    fn run_resolution(&self, resolution: Resolution) -> TxResult {
        let Resolution {
            id,
            result,
            callbacks,
            restore_mode,
            depth,
        } = resolution;
        if result.is_committed() {
            self.metrics.record_commit();
        } else {
            self.metrics.record_abort();
        }
        let _restore = RestoreMode(restore_mode);
        let count = callbacks.len();
        for task in callbacks {
            task();
        }
        debug!(target: "rewind::txn", txn_id = %id, result = %result, callbacks = count, depth, "Transaction resolved");
        result
    }

    /// Resolve the current level, which must have been opened manually
    fn resolve_manual(
        &self,
        resolve: impl FnOnce(&mut TransactionStack) -> Result<Resolution>,
    ) -> Result<TxResult> {
        let resolution = with_stack(|s| {
            match s.current().map(|txn| (txn.id(), txn.is_manual())) {
                None => Err(RewindError::NoActiveTransaction),
                Some((id, false)) => Err(RewindError::invalid_state(format!(
                    "{} was not opened by start_transaction",
                    id
                ))),
                Some(_) => resolve(s),
            }
        })?;
        Ok(self.run_resolution(resolution))
    }
}

impl Runtime for Speculative {
    fn name(&self) -> &'static str {
        "speculative"
    }

    fn transact(&self, work: &mut dyn FnMut() -> WorkResult) -> TxResult {
        self.run_level(Transaction::new(), ExecMode::Tracked, work)
    }

    fn transact_then_untracked(&self, work: &mut dyn FnMut() -> WorkResult) -> TxResult {
        self.run_level(Transaction::new(), ExecMode::Untracked, work)
    }

    fn transact_pending(
        &self,
        txn: Transaction,
        work: &mut dyn FnMut() -> WorkResult,
    ) -> TxResult {
        self.run_level(txn, ExecMode::Tracked, work)
    }

    fn commit_or_die(&self, work: &mut dyn FnMut() -> WorkResult) {
        let result = self.transact(work);
        if !result.is_committed() {
            error!(target: "rewind::txn", result = %result, "Transaction required to commit did not");
            std::process::abort();
        }
    }

    fn request_abort(&self, reason: AbortReason) -> Result<TxStatus> {
        if let AbortReason::Language(message) = &reason {
            warn!(target: "rewind::txn", message = %message, "Language abort requested");
        }
        with_stack(|s| {
            s.request_abort(reason)?;
            Ok(s.status())
        })
    }

    fn start_transaction(&self) -> Result<TxnId> {
        let id = with_stack(|s| s.start_nested())?;
        self.metrics.record_start();
        Ok(id)
    }

    fn commit_transaction(&self) -> Result<TxResult> {
        self.resolve_manual(|s| s.commit())
    }

    fn abort_transaction(&self, reason: AbortReason) -> Result<TxResult> {
        self.resolve_manual(|s| s.abort(reason))
    }

    fn clear_status(&self) {
        with_stack(|s| s.clear_status());
    }

    fn run_untracked(&self, work: &mut dyn FnMut()) {
        let previous = with_stack(|s| {
            if s.is_tracked() {
                s.set_mode(ExecMode::Untracked).ok()
            } else {
                None
            }
        });
        let _restore = previous.map(RestoreMode);
        work();
    }

    fn run_tracked(&self, work: &mut dyn FnMut() -> WorkResult) -> Result<TxStatus> {
        let previous = with_stack(|s| {
            if let ExecMode::CommittingOrAborting(phase) = s.mode() {
                return Err(RewindError::TransactInCallback(phase));
            }
            s.set_mode(ExecMode::Tracked)
        })?;
        let outcome = {
            let _restore = RestoreMode(previous);
            work()
        };
        if let Err(reason) = outcome {
            self.request_abort(reason)?;
        }
        Ok(self.status())
    }

    fn record_write(&self, slot: SlotRef) -> bool {
        with_stack(|s| s.record_write(slot))
    }

    fn on_commit(&self, task: Callback) {
        context::on_commit(task);
    }

    fn on_abort(&self, task: Callback) -> bool {
        context::on_abort(task)
    }

    fn push_on_abort_handler(&self, key: HandlerKey, task: Callback) -> bool {
        with_stack(|s| s.push_on_abort_handler(key, task))
    }

    fn pop_on_abort_handler(&self, key: HandlerKey) -> bool {
        with_stack(|s| s.pop_on_abort_handler(key))
    }

    fn pop_all_on_abort_handlers(&self, key: HandlerKey) -> usize {
        with_stack(|s| s.pop_all_on_abort_handlers(key))
    }

    fn keep_alive(&self, owner: Owner) -> bool {
        with_stack(|s| s.add_root(owner))
    }

    fn is_tracked(&self) -> bool {
        context::is_tracked()
    }

    fn is_transactional(&self) -> bool {
        context::is_transactional()
    }

    fn is_committing_or_aborting(&self) -> bool {
        with_stack(|s| s.is_committing_or_aborting())
    }

    fn status(&self) -> TxStatus {
        with_stack(|s| s.status())
    }

    fn current_transaction(&self) -> Option<TxnId> {
        with_stack(|s| s.current().map(Transaction::id))
    }

    fn consistency_check(&self) -> Result<()> {
        with_stack(|s| s.consistency_check())
    }

    fn metrics(&self) -> TransactionMetrics {
        self.metrics.snapshot()
    }
}

// ============================================================================
// PassThrough
// ============================================================================

/// Runtime with speculation switched off
#[derive(Debug, Default)]
pub struct PassThrough {
    metrics: MetricsRecorder,
}

impl PassThrough {
    /// Create a pass-through runtime
    pub fn new() -> Self {
        Self::default()
    }

    fn run(&self, work: &mut dyn FnMut() -> WorkResult) -> TxResult {
        self.metrics.record_start();
        match work() {
            Ok(()) => {
                self.metrics.record_commit();
                TxResult::Committed
            }
            Err(reason) => {
                warn!(target: "rewind::txn", reason = %reason, "Abort without speculation; nothing rolled back");
                self.metrics.record_abort();
                reason.result()
            }
        }
    }
}

impl Runtime for PassThrough {
    fn name(&self) -> &'static str {
        "pass_through"
    }

    fn transact(&self, work: &mut dyn FnMut() -> WorkResult) -> TxResult {
        self.run(work)
    }

    fn transact_then_untracked(&self, work: &mut dyn FnMut() -> WorkResult) -> TxResult {
        self.run(work)
    }

    fn transact_pending(
        &self,
        txn: Transaction,
        work: &mut dyn FnMut() -> WorkResult,
    ) -> TxResult {
        if txn.is_aborted() {
            self.metrics.record_skipped();
            return TxResult::AbortedByRequest;
        }
        self.run(work)
    }

    fn commit_or_die(&self, work: &mut dyn FnMut() -> WorkResult) {
        let result = self.run(work);
        if !result.is_committed() {
            error!(target: "rewind::txn", result = %result, "Transaction required to commit did not");
            std::process::abort();
        }
    }

    fn request_abort(&self, _reason: AbortReason) -> Result<TxStatus> {
        Err(RewindError::NoActiveTransaction)
    }

    fn start_transaction(&self) -> Result<TxnId> {
        Err(RewindError::NoActiveTransaction)
    }

    fn commit_transaction(&self) -> Result<TxResult> {
        Err(RewindError::NoActiveTransaction)
    }

    fn abort_transaction(&self, _reason: AbortReason) -> Result<TxResult> {
        Err(RewindError::NoActiveTransaction)
    }

    fn clear_status(&self) {}

    fn run_untracked(&self, work: &mut dyn FnMut()) {
        work();
    }

    fn run_tracked(&self, _work: &mut dyn FnMut() -> WorkResult) -> Result<TxStatus> {
        Err(RewindError::NoActiveTransaction)
    }

    fn record_write(&self, _slot: SlotRef) -> bool {
        false
    }

    fn on_commit(&self, task: Callback) {
        task();
    }

    fn on_abort(&self, _task: Callback) -> bool {
        false
    }

    fn push_on_abort_handler(&self, _key: HandlerKey, _task: Callback) -> bool {
        false
    }

    fn pop_on_abort_handler(&self, _key: HandlerKey) -> bool {
        false
    }

    fn pop_all_on_abort_handlers(&self, _key: HandlerKey) -> usize {
        0
    }

    fn keep_alive(&self, _owner: Owner) -> bool {
        false
    }

    fn is_tracked(&self) -> bool {
        false
    }

    fn is_transactional(&self) -> bool {
        false
    }

    fn is_committing_or_aborting(&self) -> bool {
        false
    }

    fn status(&self) -> TxStatus {
        TxStatus::Idle
    }

    fn current_transaction(&self) -> Option<TxnId> {
        None
    }

    fn consistency_check(&self) -> Result<()> {
        Ok(())
    }

    fn metrics(&self) -> TransactionMetrics {
        self.metrics.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::TxCell;
    use static_assertions::assert_obj_safe;
    use std::cell::RefCell;
    use std::rc::Rc;

    assert_obj_safe!(Runtime);

    fn speculative() -> Speculative {
        Speculative::new(RuntimeConfig::default())
    }

    #[test]
    fn test_transact_commits() {
        let rt = speculative();
        let x = TxCell::new(5);
        let result = rt.transact(&mut || {
            x.set(1);
            Ok(())
        });
        assert_eq!(result, TxResult::Committed);
        assert_eq!(x.get(), 1);
        assert_eq!(rt.status(), TxStatus::Idle);
        rt.consistency_check().unwrap();
    }

    #[test]
    fn test_transact_error_rolls_back() {
        let rt = speculative();
        let x = TxCell::new(5);
        let result = rt.transact(&mut || {
            x.set(1);
            x.set(2);
            Err(AbortReason::Request)
        });
        assert_eq!(result, TxResult::AbortedByRequest);
        assert_eq!(x.get(), 5);
    }

    #[test]
    fn test_request_abort_honored_after_ok() {
        let rt = speculative();
        let x = TxCell::new(5);
        let result = rt.transact(&mut || {
            x.set(9);
            rt.request_abort(AbortReason::language("unsupported call")).unwrap();
            Ok(())
        });
        assert_eq!(result, TxResult::AbortedByLanguage);
        assert_eq!(x.get(), 5);
    }

    #[test]
    fn test_transact_with_returns_value() {
        let rt = speculative();
        let outcome = rt.transact_with(|| Ok(21 * 2));
        assert_eq!(outcome, Outcome::Committed(42));

        let outcome: Outcome<i32> = rt.transact_with(|| rt.abort_current(AbortReason::Request));
        assert_eq!(outcome.result(), TxResult::AbortedByRequest);
        assert!(outcome.committed().is_none());
    }

    #[test]
    fn test_transact_then_untracked_keeps_writes() {
        let rt = speculative();
        let x = TxCell::new(5);
        let result = rt.transact_then_untracked(&mut || {
            assert!(rt.is_transactional());
            assert!(!rt.is_tracked());
            x.set(6);
            Err(AbortReason::Request)
        });
        assert_eq!(result, TxResult::AbortedByRequest);
        assert_eq!(x.get(), 6);
    }

    #[test]
    fn test_on_commit_outside_transaction_runs_now() {
        let rt = speculative();
        let ran = Rc::new(RefCell::new(false));
        let r = ran.clone();
        rt.on_commit(Box::new(move || *r.borrow_mut() = true));
        assert!(*ran.borrow());
        assert!(!rt.on_abort(Box::new(|| {})));
    }

    #[test]
    fn test_transact_from_commit_callback_is_rejected() {
        let rt = Rc::new(speculative());
        let inner_result = Rc::new(RefCell::new(None));
        let (rt2, slot) = (rt.clone(), inner_result.clone());
        let result = rt.transact(&mut || {
            let (rt3, slot2) = (rt2.clone(), slot.clone());
            rt2.on_commit(Box::new(move || {
                let r = rt3.transact(&mut || panic!("work must not run"));
                *slot2.borrow_mut() = Some(r);
            }));
            Ok(())
        });
        assert_eq!(result, TxResult::Committed);
        assert_eq!(
            *inner_result.borrow(),
            Some(TxResult::AbortedByTransactInOnCommit)
        );
    }

    #[test]
    fn test_pending_transaction_aborted_before_start_is_skipped() {
        let rt = speculative();
        let mut txn = Transaction::new();
        txn.abort().unwrap();
        let result = rt.transact_pending(txn, &mut || panic!("work must not run"));
        assert_eq!(result, TxResult::AbortedByRequest);
        assert_eq!(rt.metrics().total_started, 0);
        assert_eq!(rt.metrics().total_aborted, 1);
    }

    #[test]
    fn test_manual_levels_outside_nest_are_errors() {
        let rt = speculative();
        assert!(matches!(
            rt.start_transaction(),
            Err(RewindError::NoActiveTransaction)
        ));
        assert!(matches!(
            rt.commit_transaction(),
            Err(RewindError::NoActiveTransaction)
        ));
        assert!(matches!(
            rt.run_tracked(&mut || Ok(())),
            Err(RewindError::NoActiveTransaction)
        ));
    }

    #[test]
    fn test_commit_transaction_rejects_automatic_level() {
        let rt = speculative();
        rt.transact(&mut || {
            assert!(matches!(
                rt.commit_transaction(),
                Err(RewindError::InvalidState(_))
            ));
            Ok(())
        });
    }

    #[test]
    fn test_unbalanced_manual_level_is_aborted() {
        let rt = speculative();
        let x = TxCell::new(1);
        let result = rt.transact(&mut || {
            rt.start_transaction().unwrap();
            x.set(2);
            Ok(())
        });
        // The outer level still commits; the leaked inner level was rolled back
        assert_eq!(result, TxResult::Committed);
        assert_eq!(x.get(), 1);
        rt.consistency_check().unwrap();
    }

    #[test]
    fn test_metrics_count_levels() {
        let rt = speculative();
        rt.transact(&mut || {
            rt.transact(&mut || Ok(()));
            Ok(())
        });
        rt.transact(&mut || Err(AbortReason::Request));
        let metrics = rt.metrics();
        assert_eq!(metrics.total_started, 3);
        assert_eq!(metrics.total_committed, 2);
        assert_eq!(metrics.total_aborted, 1);
        assert_eq!(metrics.active_count, 0);
    }

    #[test]
    fn test_pass_through_runs_directly() {
        let rt = PassThrough::new();
        let x = TxCell::new(5);
        let result = rt.transact(&mut || {
            assert!(!rt.is_tracked());
            x.set(1);
            Err(AbortReason::Request)
        });
        assert_eq!(result, TxResult::AbortedByRequest);
        assert_eq!(x.get(), 1);
        assert!(matches!(
            rt.start_transaction(),
            Err(RewindError::NoActiveTransaction)
        ));
        assert_eq!(rt.status(), TxStatus::Idle);
    }

    #[test]
    fn test_abort_current_outside_nest_still_returns_reason() {
        let rt = PassThrough::new();
        let result = rt.transact(&mut || rt.abort_current(AbortReason::Request));
        assert_eq!(result, TxResult::AbortedByRequest);

        let rt = speculative();
        assert_eq!(
            rt.abort_current::<()>(AbortReason::Cascade),
            Err(AbortReason::Cascade)
        );
        assert_eq!(rt.status(), TxStatus::Idle);
    }

    #[test]
    fn test_runtime_from_config() {
        assert_eq!(runtime_from_config(&RuntimeConfig::default()).name(), "speculative");
        assert_eq!(runtime_from_config(&RuntimeConfig::disabled()).name(), "pass_through");
    }
}

//! C boundary for Rewind
//!
//! Exposes the process-wide runtime to instrumented host code through
//! `extern "C"` entry points and a fixed-layout function table.
//!
//! - Work and callbacks are `(fn, arg)` pairs; `arg` is passed through untouched.
//! - Results and statuses cross as plain `c_int` (`TxResult` / `TxStatus` raw values).
//! - Host code cannot return an abort, so `rewind_abort` and
//!   `rewind_cascading_abort` mark the current level and the abort happens when
//!   the work returns.
//! - Misuse that leaves the nest in an unknown state (manual commit with no
//!   level, abort from a commit or abort callback, tracked execution outside
//!   a nest) logs at error level and aborts the process.
//!
//! The runtime is built on first use from `RuntimeConfig::from_env`.

#![warn(missing_docs)]
#![warn(clippy::all)]

use once_cell::sync::Lazy;
use rewind_core::{AbortReason, HandlerKey, HostSlot, RewindError, SlotRef, TxResult, TxStatus};
use rewind_engine::{runtime_from_config, FunctionRegistry, Runtime, RuntimeConfig};
use std::mem;
use std::os::raw::{c_int, c_void};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Version of the function table layout
pub const REWIND_ABI_VERSION: u32 = 1;

/// Host work or callback
pub type RewindWorkFn = unsafe extern "C" fn(arg: *mut c_void);

/// Host deallocation routine used by allocation tracking
pub type RewindFreeFn = unsafe extern "C" fn(ptr: *mut c_void);

static RUNTIME: Lazy<Arc<dyn Runtime>> = Lazy::new(|| {
    let config = RuntimeConfig::from_env().unwrap_or_else(|e| {
        warn!(target: "rewind::abi", error = %e, "Invalid runtime configuration; using defaults");
        RuntimeConfig::default()
    });
    runtime_from_config(&config)
});

fn runtime() -> &'static dyn Runtime {
    &**RUNTIME
}

fn fatal(operation: &'static str, error: &RewindError) -> ! {
    error!(target: "rewind::abi", operation, error = %error, "Fatal misuse of the transactional runtime");
    std::process::abort()
}

fn flag(value: bool) -> c_int {
    c_int::from(value)
}

/// Wrap a host `(fn, arg)` pair as a deferred callback
fn host_callback(work: RewindWorkFn, arg: *mut c_void) -> Box<dyn FnOnce()> {
    // SAFETY: the host guarantees `arg` stays valid until the callback has run
    // or the nest has resolved without it.
    Box::new(move || unsafe { work(arg) })
}

fn request_abort(operation: &'static str, reason: AbortReason) {
    if let Err(e) = runtime().request_abort(reason) {
        fatal(operation, &e);
    }
}

// ============================================================================
// Transactions
// ============================================================================

/// Run `work(arg)` in a new nesting level and return its `TxResult`
///
/// # Safety
///
/// `work` must be safe to call with `arg`.
#[no_mangle]
pub unsafe extern "C" fn rewind_transact(work: RewindWorkFn, arg: *mut c_void) -> c_int {
    runtime()
        .transact(&mut || {
            work(arg);
            Ok(())
        })
        .as_raw()
}

/// Like `rewind_transact`, but the body starts untracked
///
/// # Safety
///
/// `work` must be safe to call with `arg`.
#[no_mangle]
pub unsafe extern "C" fn rewind_transact_then_untracked(
    work: RewindWorkFn,
    arg: *mut c_void,
) -> c_int {
    runtime()
        .transact_then_untracked(&mut || {
            work(arg);
            Ok(())
        })
        .as_raw()
}

/// Run `work(arg)` in a new level that must commit; aborts the process otherwise
///
/// # Safety
///
/// `work` must be safe to call with `arg`.
#[no_mangle]
pub unsafe extern "C" fn rewind_commit(work: RewindWorkFn, arg: *mut c_void) {
    runtime().commit_or_die(&mut || {
        work(arg);
        Ok(())
    });
}

/// Abort the current level when its work returns
#[no_mangle]
pub extern "C" fn rewind_abort() {
    request_abort("abort", AbortReason::Request);
}

/// Abort every level of the nest when the current work returns
#[no_mangle]
pub extern "C" fn rewind_cascading_abort() {
    request_abort("cascading_abort", AbortReason::Cascade);
}

/// Open a manual nesting level inside the active nest
#[no_mangle]
pub extern "C" fn rewind_start_transaction() {
    if let Err(e) = runtime().start_transaction() {
        fatal("start_transaction", &e);
    }
}

/// Resolve the manual level opened by `rewind_start_transaction`
///
/// Returns `Committed`, or the abort result if an abort was pending.
#[no_mangle]
pub extern "C" fn rewind_commit_transaction() -> c_int {
    match runtime().commit_transaction() {
        Ok(result) => result.as_raw(),
        Err(e) => fatal("commit_transaction", &e),
    }
}

/// Forget a pending abort of the current nest
#[no_mangle]
pub extern "C" fn rewind_clear_status() {
    runtime().clear_status();
}

/// Current `TxStatus` of the calling thread
#[no_mangle]
pub extern "C" fn rewind_status() -> c_int {
    runtime().status().as_raw()
}

// ============================================================================
// Execution mode
// ============================================================================

/// Run `work(arg)` with write tracking suspended
///
/// # Safety
///
/// `work` must be safe to call with `arg`.
#[no_mangle]
pub unsafe extern "C" fn rewind_run_untracked(work: RewindWorkFn, arg: *mut c_void) {
    runtime().run_untracked(&mut || work(arg));
}

/// Run `work(arg)` tracked inside the active nest and return the live `TxStatus`
///
/// # Safety
///
/// `work` must be safe to call with `arg`.
#[no_mangle]
pub unsafe extern "C" fn rewind_run_tracked(work: RewindWorkFn, arg: *mut c_void) -> c_int {
    let status = runtime().run_tracked(&mut || {
        work(arg);
        Ok(())
    });
    match status {
        Ok(status) => status.as_raw(),
        Err(e) => fatal("run_tracked", &e),
    }
}

// ============================================================================
// Write tracking
// ============================================================================

/// Log `size` bytes at `ptr` before tracked code overwrites them
///
/// Returns 1 if a new log entry was made.
///
/// # Safety
///
/// `ptr..ptr+size` must stay valid until the nest resolves and must not be
/// accessed by other threads while the nest is active.
#[no_mangle]
pub unsafe extern "C" fn rewind_record_write(ptr: *mut c_void, size: usize) -> c_int {
    let rt = runtime();
    if ptr.is_null() || size == 0 || !rt.is_tracked() {
        return 0;
    }
    let slot = SlotRef::HostObject(HostSlot::new(ptr.cast::<u8>(), size, None));
    flag(rt.record_write(slot))
}

/// Register `allocated` as freshly allocated by tracked code
///
/// If the nest aborts, `free_fn(allocated)` releases it. Returns `allocated`.
///
/// # Safety
///
/// `free_fn` must be the routine that matches the allocation of `allocated`,
/// and nothing else may free it while the nest is active.
#[no_mangle]
pub unsafe extern "C" fn rewind_record_allocation(
    allocated: *mut c_void,
    size: usize,
    free_fn: RewindFreeFn,
) -> *mut c_void {
    let rt = runtime();
    if allocated.is_null() || !rt.is_tracked() {
        return allocated;
    }
    debug!(target: "rewind::abi", size, "Allocation tracked");
    rt.on_abort(Box::new(move || free_fn(allocated)));
    allocated
}

/// Free `ptr` once the nest commits
///
/// Outside tracked code the memory is freed immediately. If the nest aborts,
/// it is never freed.
///
/// # Safety
///
/// `free_fn` must be the routine that matches the allocation of `ptr`.
#[no_mangle]
pub unsafe extern "C" fn rewind_record_free(ptr: *mut c_void, free_fn: RewindFreeFn) {
    if ptr.is_null() {
        return;
    }
    runtime().on_commit(Box::new(move || free_fn(ptr)));
}

// ============================================================================
// Replacement functions
// ============================================================================

/// Register `replacement` to be called instead of `original` from tracked code
#[no_mangle]
pub extern "C" fn rewind_register_replacement(original: *const c_void, replacement: *const c_void) {
    if original.is_null() || replacement.is_null() {
        warn!(target: "rewind::abi", "Null function passed to register_replacement; ignored");
        return;
    }
    FunctionRegistry::global().register_replacement(original as usize, replacement as usize);
}

/// Function to call in place of `original`
///
/// Outside tracked code `original` is returned when no replacement exists. In
/// tracked code a missing replacement requests a language abort and returns
/// null; the host must return from its work without calling anything.
#[no_mangle]
pub extern "C" fn rewind_lookup_replacement(original: *const c_void) -> *const c_void {
    match FunctionRegistry::global().resolve_or_abort(original as usize) {
        Ok(function) => function as *const c_void,
        Err(reason) => {
            request_abort("lookup_replacement", reason);
            std::ptr::null()
        }
    }
}

// ============================================================================
// Callbacks
// ============================================================================

/// Run `work(arg)` after the outermost commit, or now outside tracked code
///
/// # Safety
///
/// `work` must be safe to call with `arg` whenever the callback runs.
#[no_mangle]
pub unsafe extern "C" fn rewind_on_commit(work: RewindWorkFn, arg: *mut c_void) {
    runtime().on_commit(host_callback(work, arg));
}

/// Run `work(arg)` if the nest aborts; returns 0 outside tracked code
///
/// # Safety
///
/// `work` must be safe to call with `arg` whenever the callback runs.
#[no_mangle]
pub unsafe extern "C" fn rewind_on_abort(work: RewindWorkFn, arg: *mut c_void) -> c_int {
    flag(runtime().on_abort(host_callback(work, arg)))
}

/// Install `work(arg)` as an on-abort handler under `key`
///
/// # Safety
///
/// `work` must be safe to call with `arg` whenever the handler runs.
#[no_mangle]
pub unsafe extern "C" fn rewind_push_on_abort_handler(
    key: *const c_void,
    work: RewindWorkFn,
    arg: *mut c_void,
) -> c_int {
    flag(runtime().push_on_abort_handler(HandlerKey(key as usize), host_callback(work, arg)))
}

/// Remove the newest handler under `key`
///
/// Returns 1 if it was found in the current level; otherwise the pop is
/// applied to the parent when the level commits.
#[no_mangle]
pub extern "C" fn rewind_pop_on_abort_handler(key: *const c_void) -> c_int {
    flag(runtime().pop_on_abort_handler(HandlerKey(key as usize)))
}

/// Remove every handler under `key`; returns how many the current level held
#[no_mangle]
pub extern "C" fn rewind_pop_all_on_abort_handlers(key: *const c_void) -> c_int {
    let removed = runtime().pop_all_on_abort_handlers(HandlerKey(key as usize));
    c_int::try_from(removed).unwrap_or(c_int::MAX)
}

// ============================================================================
// Queries
// ============================================================================

/// 1 if writes are being logged right now
#[no_mangle]
pub extern "C" fn rewind_is_tracked() -> c_int {
    flag(runtime().is_tracked())
}

/// 1 if any nesting level is active on this thread
#[no_mangle]
pub extern "C" fn rewind_is_transactional() -> c_int {
    flag(runtime().is_transactional())
}

/// 1 while on-commit or on-abort callbacks are running
#[no_mangle]
pub extern "C" fn rewind_is_committing_or_aborting() -> c_int {
    flag(runtime().is_committing_or_aborting())
}

/// 1 if this thread's nest passes its structural checks
#[no_mangle]
pub extern "C" fn rewind_consistency_check() -> c_int {
    match runtime().consistency_check() {
        Ok(()) => 1,
        Err(e) => {
            error!(target: "rewind::abi", error = %e, "Consistency check failed");
            0
        }
    }
}

// ============================================================================
// Function table
// ============================================================================

/// Fixed-layout table of every entry point
///
/// Fields are only ever appended; `size` lets a host built against an older
/// layout detect the fields it knows about.
#[repr(C)]
pub struct RewindApi {
    /// `REWIND_ABI_VERSION` of this table
    pub version: u32,
    /// `size_of::<RewindApi>()`
    pub size: usize,
    /// `rewind_transact`
    pub transact: unsafe extern "C" fn(RewindWorkFn, *mut c_void) -> c_int,
    /// `rewind_transact_then_untracked`
    pub transact_then_untracked: unsafe extern "C" fn(RewindWorkFn, *mut c_void) -> c_int,
    /// `rewind_commit`
    pub commit: unsafe extern "C" fn(RewindWorkFn, *mut c_void),
    /// `rewind_abort`
    pub abort: extern "C" fn(),
    /// `rewind_cascading_abort`
    pub cascading_abort: extern "C" fn(),
    /// `rewind_start_transaction`
    pub start_transaction: extern "C" fn(),
    /// `rewind_commit_transaction`
    pub commit_transaction: extern "C" fn() -> c_int,
    /// `rewind_clear_status`
    pub clear_status: extern "C" fn(),
    /// `rewind_status`
    pub status: extern "C" fn() -> c_int,
    /// `rewind_run_untracked`
    pub run_untracked: unsafe extern "C" fn(RewindWorkFn, *mut c_void),
    /// `rewind_run_tracked`
    pub run_tracked: unsafe extern "C" fn(RewindWorkFn, *mut c_void) -> c_int,
    /// `rewind_record_write`
    pub record_write: unsafe extern "C" fn(*mut c_void, usize) -> c_int,
    /// `rewind_register_replacement`
    pub register_replacement: extern "C" fn(*const c_void, *const c_void),
    /// `rewind_lookup_replacement`
    pub lookup_replacement: extern "C" fn(*const c_void) -> *const c_void,
    /// `rewind_on_commit`
    pub on_commit: unsafe extern "C" fn(RewindWorkFn, *mut c_void),
    /// `rewind_on_abort`
    pub on_abort: unsafe extern "C" fn(RewindWorkFn, *mut c_void) -> c_int,
    /// `rewind_push_on_abort_handler`
    pub push_on_abort_handler:
        unsafe extern "C" fn(*const c_void, RewindWorkFn, *mut c_void) -> c_int,
    /// `rewind_pop_on_abort_handler`
    pub pop_on_abort_handler: extern "C" fn(*const c_void) -> c_int,
    /// `rewind_pop_all_on_abort_handlers`
    pub pop_all_on_abort_handlers: extern "C" fn(*const c_void) -> c_int,
    /// `rewind_record_allocation`
    pub record_allocation: unsafe extern "C" fn(*mut c_void, usize, RewindFreeFn) -> *mut c_void,
    /// `rewind_record_free`
    pub record_free: unsafe extern "C" fn(*mut c_void, RewindFreeFn),
    /// `rewind_is_tracked`
    pub is_tracked: extern "C" fn() -> c_int,
    /// `rewind_is_transactional`
    pub is_transactional: extern "C" fn() -> c_int,
    /// `rewind_is_committing_or_aborting`
    pub is_committing_or_aborting: extern "C" fn() -> c_int,
    /// `rewind_consistency_check`
    pub consistency_check: extern "C" fn() -> c_int,
}

static API: RewindApi = RewindApi {
    version: REWIND_ABI_VERSION,
    size: mem::size_of::<RewindApi>(),
    transact: rewind_transact,
    transact_then_untracked: rewind_transact_then_untracked,
    commit: rewind_commit,
    abort: rewind_abort,
    cascading_abort: rewind_cascading_abort,
    start_transaction: rewind_start_transaction,
    commit_transaction: rewind_commit_transaction,
    clear_status: rewind_clear_status,
    status: rewind_status,
    run_untracked: rewind_run_untracked,
    run_tracked: rewind_run_tracked,
    record_write: rewind_record_write,
    register_replacement: rewind_register_replacement,
    lookup_replacement: rewind_lookup_replacement,
    on_commit: rewind_on_commit,
    on_abort: rewind_on_abort,
    push_on_abort_handler: rewind_push_on_abort_handler,
    pop_on_abort_handler: rewind_pop_on_abort_handler,
    pop_all_on_abort_handlers: rewind_pop_all_on_abort_handlers,
    record_allocation: rewind_record_allocation,
    record_free: rewind_record_free,
    is_tracked: rewind_is_tracked,
    is_transactional: rewind_is_transactional,
    is_committing_or_aborting: rewind_is_committing_or_aborting,
    consistency_check: rewind_consistency_check,
};

/// The process-wide function table
#[no_mangle]
pub extern "C" fn rewind_api() -> *const RewindApi {
    &API
}

/// 1 if a host built against `version` with a table of `size` bytes can use
/// this runtime
///
/// Logged at error level on mismatch; the host decides whether to abort.
#[no_mangle]
pub extern "C" fn rewind_check_layout(version: u32, size: usize) -> c_int {
    let ok = version == REWIND_ABI_VERSION && size == mem::size_of::<RewindApi>();
    if !ok {
        error!(
            target: "rewind::abi",
            expected_version = REWIND_ABI_VERSION,
            expected_size = mem::size_of::<RewindApi>(),
            version,
            size,
            "Host and runtime disagree on the interface layout"
        );
    }
    flag(ok)
}

/// Integer value of `result` at this boundary
pub fn result_code(result: TxResult) -> c_int {
    result.as_raw()
}

/// Integer value of `status` at this boundary
pub fn status_code(status: TxStatus) -> c_int {
    status.as_raw()
}

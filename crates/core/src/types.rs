//! Identity, mode and outcome types
//!
//! `TxResult` and `TxStatus` cross the C boundary as plain integers, so their
//! discriminants are fixed and must never be reordered.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier of one transaction nesting level
///
/// Ids are process-unique and monotonically increasing. A nested level
/// records its parent's id as its (weak) parent link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxnId(u64);

impl TxnId {
    /// Allocate a fresh id
    pub fn next() -> Self {
        TxnId(NEXT_TXN_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// Key under which on-abort handlers are pushed and popped
///
/// Typically the address of the object a scope is mutating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerKey(pub usize);

impl HandlerKey {
    /// Key derived from the address of `value`
    pub fn of<T: ?Sized>(value: &T) -> Self {
        HandlerKey(value as *const T as *const () as usize)
    }
}

impl From<usize> for HandlerKey {
    fn from(raw: usize) -> Self {
        HandlerKey(raw)
    }
}

/// Which resolution is running its callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Outermost commit is running on-commit closures
    Commit,
    /// An abort is replaying its log and running on-abort handlers
    Abort,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Commit => write!(f, "committing"),
            Phase::Abort => write!(f, "aborting"),
        }
    }
}

/// Execution mode of the code currently running on a thread
///
/// State transitions:
/// - `NotTransactional` → `Tracked` (outermost start)
/// - `Tracked` ↔ `Untracked` (run-untracked / run-tracked)
/// - `Untracked` → `Tracked` (nested start from untracked code)
/// - any level resolving → `CommittingOrAborting` while callbacks run,
///   then back to the mode the level was entered from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExecMode {
    /// No nesting level is active
    #[default]
    NotTransactional,
    /// Writes are logged and undoable
    Tracked,
    /// Writes take effect immediately and are never logged
    Untracked,
    /// A level is resolving; its callbacks are running
    CommittingOrAborting(Phase),
}

impl ExecMode {
    /// Whether writes must be logged right now
    pub fn is_tracked(&self) -> bool {
        matches!(self, ExecMode::Tracked)
    }

    /// Whether a commit or abort is running its callbacks
    pub fn is_committing_or_aborting(&self) -> bool {
        matches!(self, ExecMode::CommittingOrAborting(_))
    }
}

/// How a whole transactional call ended
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxResult {
    /// Work finished and the level committed (or joined its parent)
    Committed = 0,
    /// Work asked to abort
    AbortedByRequest = 1,
    /// Runtime detected something not expressible transactionally
    AbortedByLanguage = 2,
    /// Aborted because some level of the nest requested a cascading abort
    AbortedByCascade = 3,
    /// Transaction was started from inside an on-commit closure
    AbortedByTransactInOnCommit = 4,
    /// Transaction was started from inside an on-abort closure
    AbortedByTransactInOnAbort = 5,
}

impl TxResult {
    /// Integer value used at the C boundary
    pub fn as_raw(self) -> i32 {
        self as i32
    }

    /// Parse a boundary integer
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(TxResult::Committed),
            1 => Some(TxResult::AbortedByRequest),
            2 => Some(TxResult::AbortedByLanguage),
            3 => Some(TxResult::AbortedByCascade),
            4 => Some(TxResult::AbortedByTransactInOnCommit),
            5 => Some(TxResult::AbortedByTransactInOnAbort),
            _ => None,
        }
    }

    /// Check if the call committed
    pub fn is_committed(self) -> bool {
        self == TxResult::Committed
    }
}

impl fmt::Display for TxResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxResult::Committed => "committed",
            TxResult::AbortedByRequest => "aborted by request",
            TxResult::AbortedByLanguage => "aborted by language",
            TxResult::AbortedByCascade => "aborted by cascade",
            TxResult::AbortedByTransactInOnCommit => "aborted by transact in on-commit",
            TxResult::AbortedByTransactInOnAbort => "aborted by transact in on-abort",
        };
        f.write_str(name)
    }
}

/// What state the calling thread's transaction context is in right now
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxStatus {
    /// No nesting level is active
    Idle = 0,
    /// Inside a nest, no abort pending
    OnTrack = 1,
    /// Outermost commit is running its on-commit closures
    Committing = 2,
    /// An abort by request is pending
    AbortedByRequest = 3,
    /// A language abort is pending
    AbortedByLanguage = 4,
    /// A cascading abort is pending
    AbortedByCascade = 5,
}

impl TxStatus {
    /// Integer value used at the C boundary
    pub fn as_raw(self) -> i32 {
        self as i32
    }

    /// Parse a boundary integer
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(TxStatus::Idle),
            1 => Some(TxStatus::OnTrack),
            2 => Some(TxStatus::Committing),
            3 => Some(TxStatus::AbortedByRequest),
            4 => Some(TxStatus::AbortedByLanguage),
            5 => Some(TxStatus::AbortedByCascade),
            _ => None,
        }
    }

    /// Whether an abort is pending
    pub fn is_aborting(self) -> bool {
        matches!(
            self,
            TxStatus::AbortedByRequest | TxStatus::AbortedByLanguage | TxStatus::AbortedByCascade
        )
    }
}

//! Undo log for one nesting level
//!
//! The log holds the value every tracked slot had immediately before the
//! level first wrote it. The seen set keeps slot keys unique: the first
//! record for a key wins and later records are no-ops, so any number of
//! writes to a slot collapse into one entry.
//!
//! ## Invariants
//!
//! - `record` runs strictly before the mutation it protects, so the captured
//!   value is the pre-write value.
//! - `join` never re-reads memory: by join time a slot may already hold the
//!   child's new value, so only the child's captured values are offered.
//! - `entries.len() == seen.len()` at all times.

use rewind_core::{OldValue, Owner, SlotKey, SlotRef};
use std::collections::HashSet;
use std::fmt;

/// One saved slot: where to write, and what to write back
pub struct LogEntry {
    slot: SlotRef,
    old: OldValue,
}

impl LogEntry {
    /// Dedup key of the slot
    pub fn key(&self) -> SlotKey {
        self.slot.key()
    }

    /// The slot this entry restores
    pub fn slot(&self) -> &SlotRef {
        &self.slot
    }

    /// The captured pre-write value
    pub fn old_value(&self) -> &OldValue {
        &self.old
    }

    fn restore(self) {
        self.slot.restore(self.old);
    }
}

impl fmt::Debug for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogEntry")
            .field("slot", &self.slot)
            .field("old", &self.old)
            .finish()
    }
}

/// Append-only, deduplicated record of pre-write values
#[derive(Default)]
pub struct UndoLog {
    entries: Vec<LogEntry>,
    seen: HashSet<SlotKey>,
    roots: Vec<Owner>,
}

impl UndoLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the current contents of `slot` if it has not been seen yet
    ///
    /// Returns true if a new entry was appended. Must be called before the
    /// slot is mutated.
    pub fn record(&mut self, slot: SlotRef) -> bool {
        if !self.seen.insert(slot.key()) {
            return false;
        }
        let old = slot.capture();
        self.entries.push(LogEntry { slot, old });
        true
    }

    /// Keep `owner` alive until this log is committed or rolled back
    pub fn add_root(&mut self, owner: Owner) {
        self.roots.push(owner);
    }

    /// Take over a committed child's entries and roots
    ///
    /// An offered entry is kept only if this log has not seen its slot, so the
    /// earliest captured value across the nest survives. Returns the number of
    /// entries kept.
    pub fn join(&mut self, child: UndoLog) -> usize {
        let UndoLog { entries, roots, .. } = child;
        let mut kept = 0;
        for entry in entries {
            if self.seen.insert(entry.key()) {
                self.entries.push(entry);
                kept += 1;
            }
        }
        self.roots.extend(roots);
        kept
    }

    /// Write every old value back to its slot
    ///
    /// Entries are replayed newest first. For disjoint slots the order does
    /// not matter; for overlapping raw ranges it leaves the oldest capture in
    /// place. Returns the number of entries replayed.
    pub fn abort(&mut self) -> usize {
        let entries = std::mem::take(&mut self.entries);
        let replayed = entries.len();
        for entry in entries.into_iter().rev() {
            entry.restore();
        }
        self.seen.clear();
        self.roots.clear();
        replayed
    }

    /// Drop all entries and roots without restoring anything
    pub fn clear(&mut self) {
        self.entries.clear();
        self.seen.clear();
        self.roots.clear();
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the log has no entries and no roots
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.roots.is_empty()
    }

    /// Whether a slot key has been recorded
    pub fn contains(&self, key: &SlotKey) -> bool {
        self.seen.contains(key)
    }

    /// Number of liveness-only roots
    pub fn root_count(&self) -> usize {
        self.roots.len()
    }

    /// Entries in record order
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Check that the seen set and the entry list agree
    pub fn is_consistent(&self) -> bool {
        self.entries.len() == self.seen.len()
            && self.entries.iter().all(|e| self.seen.contains(&e.key()))
    }
}

impl fmt::Debug for UndoLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UndoLog")
            .field("entries", &self.entries.len())
            .field("roots", &self.roots.len())
            .finish()
    }
}

//! Deferred callbacks owned by a nesting level
//!
//! - `CommitQueue`: closures that run, in registration order, when the
//!   outermost level of the nest commits. A nested commit moves them into the
//!   parent; an abort anywhere in the chain drops them.
//! - `AbortHandlers`: unkeyed on-abort closures and keyed handlers in one
//!   push-ordered list. On abort they run newest first.
//!
//! ## Keyed pops across levels
//!
//! The scope-bound idiom pushes a handler when a mutating scope is entered and
//! pops it on normal exit. If the push happened in an ancestor level, the pop
//! finds nothing locally; it is then remembered and replayed against the
//! parent when this level joins. If this level aborts instead, the remembered
//! pop is discarded with it, so the ancestor's handler stays installed.

use rewind_core::HandlerKey;
use std::fmt;

/// Deferred closure
pub type Callback = Box<dyn FnOnce()>;

/// Ordered on-commit closures
#[derive(Default)]
pub struct CommitQueue {
    tasks: Vec<Callback>,
}

impl CommitQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a closure
    pub fn push(&mut self, task: Callback) {
        self.tasks.push(task);
    }

    /// Append a committed child's closures after this level's
    pub fn join(&mut self, child: CommitQueue) {
        self.tasks.extend(child.tasks);
    }

    /// Closures in the order they must run
    pub fn into_tasks(self) -> Vec<Callback> {
        self.tasks
    }

    /// Number of queued closures
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Check if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl fmt::Debug for CommitQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitQueue")
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pop {
    One(HandlerKey),
    All(HandlerKey),
}

/// On-abort closures and keyed on-abort handlers
#[derive(Default)]
pub struct AbortHandlers {
    entries: Vec<(Option<HandlerKey>, Callback)>,
    deferred_pops: Vec<Pop>,
}

impl AbortHandlers {
    /// Create an empty handler stack
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an unkeyed on-abort closure
    pub fn push_unkeyed(&mut self, task: Callback) {
        self.entries.push((None, task));
    }

    /// Install a handler under `key`
    pub fn push(&mut self, key: HandlerKey, task: Callback) {
        self.entries.push((Some(key), task));
    }

    /// Remove the most recent handler for `key`
    ///
    /// Returns true if a handler was removed from this level. Otherwise the
    /// pop is deferred to the parent and applied on join.
    pub fn pop(&mut self, key: HandlerKey) -> bool {
        match self.entries.iter().rposition(|(k, _)| *k == Some(key)) {
            Some(idx) => {
                self.entries.remove(idx);
                true
            }
            None => {
                self.deferred_pops.push(Pop::One(key));
                false
            }
        }
    }

    /// Remove every handler for `key`, here and (on join) in ancestors
    ///
    /// Returns the number of handlers removed from this level.
    pub fn pop_all(&mut self, key: HandlerKey) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| *k != Some(key));
        self.deferred_pops.push(Pop::All(key));
        before - self.entries.len()
    }

    /// Take over a committed child's handlers
    ///
    /// The child's unmatched pops refer to handlers pushed before the child
    /// started, so they are applied first; the child's surviving handlers are
    /// then stacked on top.
    pub fn join(&mut self, child: AbortHandlers) {
        for pop in child.deferred_pops {
            match pop {
                Pop::One(key) => {
                    self.pop(key);
                }
                Pop::All(key) => {
                    self.pop_all(key);
                }
            }
        }
        self.entries.extend(child.entries);
    }

    /// Handlers in the order they must run on abort (newest first)
    pub fn into_tasks(self) -> Vec<Callback> {
        self.entries.into_iter().rev().map(|(_, task)| task).collect()
    }

    /// Number of installed handlers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no handler is installed and no pop is pending
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.deferred_pops.is_empty()
    }

    /// Number of handlers installed under `key`
    pub fn count_for(&self, key: HandlerKey) -> usize {
        self.entries.iter().filter(|(k, _)| *k == Some(key)).count()
    }
}

impl fmt::Debug for AbortHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortHandlers")
            .field("entries", &self.entries.len())
            .field("deferred_pops", &self.deferred_pops)
            .finish()
    }
}

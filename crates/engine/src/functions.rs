//! Replacement function registry
//!
//! Tracked code cannot call a function whose writes are not recorded. Hosts
//! register a transactional replacement for such a function; tracked callers
//! look it up before calling. Functions are identified by address.

use crate::context;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use rewind_core::AbortReason;
use tracing::{debug, warn};

static GLOBAL: Lazy<FunctionRegistry> = Lazy::new(FunctionRegistry::new);

/// Map from function address to the address of its transactional replacement
#[derive(Debug, Default)]
pub struct FunctionRegistry {
    replacements: DashMap<usize, usize>,
}

impl FunctionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry
    pub fn global() -> &'static FunctionRegistry {
        &GLOBAL
    }

    /// Register `replacement` for `original`, returning any previous entry
    pub fn register_replacement(&self, original: usize, replacement: usize) -> Option<usize> {
        debug!(
            target: "rewind::txn",
            original = format_args!("{:#x}", original),
            replacement = format_args!("{:#x}", replacement),
            "Registered replacement function"
        );
        self.replacements.insert(original, replacement)
    }

    /// Replacement registered for `original`
    pub fn resolve(&self, original: usize) -> Option<usize> {
        self.replacements.get(&original).map(|entry| *entry)
    }

    /// Function to call in place of `original`
    ///
    /// Outside tracked code `original` itself is safe to call. In tracked
    /// code a missing replacement is a language abort.
    pub fn resolve_or_abort(&self, original: usize) -> Result<usize, AbortReason> {
        if let Some(replacement) = self.resolve(original) {
            return Ok(replacement);
        }
        if !context::is_tracked() {
            return Ok(original);
        }
        warn!(
            target: "rewind::txn",
            function = format_args!("{:#x}", original),
            "No replacement registered for function called from tracked code"
        );
        Err(AbortReason::language(format!(
            "no transactional replacement for function {:#x}",
            original
        )))
    }

    /// Remove the entry for `original`
    pub fn unregister(&self, original: usize) -> Option<usize> {
        self.replacements.remove(&original).map(|(_, replacement)| replacement)
    }

    /// Number of registered replacements
    pub fn len(&self) -> usize {
        self.replacements.len()
    }

    /// Check if no replacement is registered
    pub fn is_empty(&self) -> bool {
        self.replacements.is_empty()
    }
}

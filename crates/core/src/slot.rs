//! Slots: the memory locations an undo log can restore
//!
//! A log entry needs three things: something that keeps the memory alive until
//! rollback (the owner), where the memory is (the slot), and what it held
//! before the first tracked write (the old value). `SlotRef` is the tagged
//! variant for the "where" part; each variant owns the reference that keeps
//! its memory alive.
//!
//! | Variant      | Memory                                  | Owner                 |
//! |--------------|-----------------------------------------|-----------------------|
//! | `Cell`       | a typed transactional cell              | the cell handle       |
//! | `HostObject` | raw bytes owned by the embedding host   | optional explicit ref |
//! | `AuxBuffer`  | a byte range inside a shared buffer     | the buffer handle     |
//!
//! Slots are deduplicated by `SlotKey {addr, len}`.

use smallvec::SmallVec;
use std::any::Any;
use std::fmt;
use std::ptr;
use std::sync::Arc;

/// Liveness-only reference that keeps an object alive until rollback
pub type Owner = Arc<dyn Any + Send + Sync>;

/// Saved bytes of an untyped slot; small writes stay inline
pub type ByteImage = SmallVec<[u8; 16]>;

/// Dedup key of a slot: start address and length in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey {
    /// Start address
    pub addr: usize,
    /// Length in bytes
    pub len: usize,
}

impl SlotKey {
    /// Create a slot key
    pub fn new(addr: usize, len: usize) -> Self {
        Self { addr, len }
    }
}

/// A typed cell whose value can be captured and written back
///
/// Implemented by the engine's transactional cells. `capture` and `restore`
/// must not themselves record writes.
pub trait CellSlot: Send + Sync {
    /// Dedup key of this cell
    fn slot_key(&self) -> SlotKey;

    /// Clone the current value
    fn capture(&self) -> Box<dyn Any>;

    /// Write a previously captured value back
    fn restore(&self, old: Box<dyn Any>);
}

/// A byte buffer whose ranges can be captured and written back
pub trait ByteSlots: Send + Sync {
    /// Stable address of byte 0
    fn base_addr(&self) -> usize;

    /// Copy `len` bytes starting at `offset`
    fn capture_bytes(&self, offset: usize, len: usize) -> ByteImage;

    /// Overwrite the bytes starting at `offset`
    fn restore_bytes(&self, offset: usize, bytes: &[u8]);
}

/// Raw host memory touched through the untyped write path
#[derive(Clone)]
pub struct HostSlot {
    owner: Option<Owner>,
    addr: usize,
    len: usize,
}

impl HostSlot {
    /// Describe `len` bytes of host memory starting at `ptr`
    ///
    /// # Safety
    ///
    /// `ptr..ptr+len` must stay valid for reads and writes until every
    /// transaction that may log this slot has committed or aborted, and must
    /// not be accessed concurrently while the slot is captured or restored.
    pub unsafe fn new(ptr: *mut u8, len: usize, owner: Option<Owner>) -> Self {
        Self {
            owner,
            addr: ptr as usize,
            len,
        }
    }

    /// Start address
    pub fn addr(&self) -> usize {
        self.addr
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the slot covers no bytes
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Explicit owner, if one was supplied
    pub fn owner(&self) -> Option<&Owner> {
        self.owner.as_ref()
    }

    fn capture(&self) -> ByteImage {
        if self.len == 0 {
            return ByteImage::new();
        }
        // SAFETY: validity of addr..addr+len is the contract of `HostSlot::new`.
        let bytes = unsafe { std::slice::from_raw_parts(self.addr as *const u8, self.len) };
        ByteImage::from_slice(bytes)
    }

    fn restore(&self, bytes: &[u8]) {
        debug_assert_eq!(bytes.len(), self.len);
        let len = bytes.len().min(self.len);
        // SAFETY: validity of addr..addr+len is the contract of `HostSlot::new`,
        // and `bytes` is an owned copy that cannot overlap the destination.
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), self.addr as *mut u8, len) };
    }
}

impl fmt::Debug for HostSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostSlot")
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("len", &self.len)
            .field("owned", &self.owner.is_some())
            .finish()
    }
}

/// Where a log entry writes its old value back
#[derive(Clone)]
pub enum SlotRef {
    /// Typed transactional cell
    Cell(Arc<dyn CellSlot>),
    /// Raw bytes owned by the host
    HostObject(HostSlot),
    /// Byte range inside a transactional buffer
    AuxBuffer {
        /// Buffer holding the range
        buffer: Arc<dyn ByteSlots>,
        /// Offset of the first byte
        offset: usize,
        /// Length of the range
        len: usize,
    },
}

impl SlotRef {
    /// Dedup key
    pub fn key(&self) -> SlotKey {
        match self {
            SlotRef::Cell(cell) => cell.slot_key(),
            SlotRef::HostObject(host) => SlotKey::new(host.addr, host.len),
            SlotRef::AuxBuffer {
                buffer,
                offset,
                len,
            } => SlotKey::new(buffer.base_addr() + offset, *len),
        }
    }

    /// Short name of the variant, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            SlotRef::Cell(_) => "cell",
            SlotRef::HostObject(_) => "host_object",
            SlotRef::AuxBuffer { .. } => "aux_buffer",
        }
    }

    /// Read the slot's current contents
    ///
    /// Must be called before the write it protects.
    pub fn capture(&self) -> OldValue {
        match self {
            SlotRef::Cell(cell) => OldValue::Typed(cell.capture()),
            SlotRef::HostObject(host) => OldValue::Bytes(host.capture()),
            SlotRef::AuxBuffer {
                buffer,
                offset,
                len,
            } => OldValue::Bytes(buffer.capture_bytes(*offset, *len)),
        }
    }

    /// Write a captured value back into the slot
    pub fn restore(&self, old: OldValue) {
        match (self, old) {
            (SlotRef::Cell(cell), OldValue::Typed(value)) => cell.restore(value),
            (SlotRef::HostObject(host), OldValue::Bytes(bytes)) => host.restore(&bytes),
            (SlotRef::AuxBuffer { buffer, offset, .. }, OldValue::Bytes(bytes)) => {
                buffer.restore_bytes(*offset, &bytes)
            }
            (slot, _) => {
                tracing::error!(
                    target: "rewind::txn",
                    kind = slot.kind(),
                    "old value does not match slot kind; entry skipped"
                );
            }
        }
    }
}

impl fmt::Debug for SlotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let key = self.key();
        f.debug_struct("SlotRef")
            .field("kind", &self.kind())
            .field("addr", &format_args!("{:#x}", key.addr))
            .field("len", &key.len)
            .finish()
    }
}

/// Pre-write contents of a slot
pub enum OldValue {
    /// Cloned value of a typed cell
    Typed(Box<dyn Any>),
    /// Copied bytes of an untyped slot
    Bytes(ByteImage),
}

impl fmt::Debug for OldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OldValue::Typed(_) => f.write_str("Typed(..)"),
            OldValue::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.as_slice()).finish(),
        }
    }
}

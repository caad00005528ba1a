//! Transactional memory
//!
//! - `TxCell<T>`: a shared typed slot. Every mutation logs the current value
//!   into the calling thread's current level first, so an abort writes it back.
//! - `TxBuffer`: a fixed-size byte buffer; writes log the exact byte range
//!   they overwrite.
//!
//! Handles are cheap to clone and share the same storage. Each handle keeps
//! its storage alive for as long as a log entry refers to it.
//!
//! Reads and writes outside tracked code are plain reads and writes.

use crate::context;
use parking_lot::Mutex;
use rewind_core::slot::ByteImage;
use rewind_core::{ByteSlots, CellSlot, Result, RewindError, SlotKey, SlotRef};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

// ============================================================================
// TxCell
// ============================================================================

struct CellInner<T> {
    value: Mutex<T>,
}

impl<T: Clone + Send + 'static> CellSlot for CellInner<T> {
    fn slot_key(&self) -> SlotKey {
        SlotKey::new(
            self as *const Self as usize,
            std::mem::size_of::<T>().max(1),
        )
    }

    fn capture(&self) -> Box<dyn Any> {
        Box::new(self.value.lock().clone())
    }

    fn restore(&self, old: Box<dyn Any>) {
        match old.downcast::<T>() {
            Ok(value) => *self.value.lock() = *value,
            Err(_) => tracing::error!(target: "rewind::txn", "cell restored with a value of another type"),
        }
    }
}

/// Typed transactional slot
///
/// Closures passed to `update` and `with` run under the cell's lock and must
/// not touch the same cell again.
pub struct TxCell<T> {
    inner: Arc<CellInner<T>>,
}

impl<T: Clone + Send + 'static> TxCell<T> {
    /// Create a cell
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(CellInner {
                value: Mutex::new(value),
            }),
        }
    }

    /// Clone the current value
    pub fn get(&self) -> T {
        self.inner.value.lock().clone()
    }

    /// Borrow the current value
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.value.lock())
    }

    /// Overwrite the value
    pub fn set(&self, value: T) {
        self.record();
        *self.inner.value.lock() = value;
    }

    /// Mutate the value in place
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        self.record();
        f(&mut self.inner.value.lock())
    }

    /// Overwrite the value, returning the old one
    pub fn replace(&self, value: T) -> T {
        self.record();
        std::mem::replace(&mut *self.inner.value.lock(), value)
    }

    /// The slot this cell logs into undo logs
    pub fn slot(&self) -> SlotRef {
        SlotRef::Cell(self.inner.clone())
    }

    /// Dedup key of this cell
    pub fn key(&self) -> SlotKey {
        self.inner.slot_key()
    }

    fn record(&self) {
        context::record_write(|| self.slot());
    }
}

impl<T> Clone for TxCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + Default + 'static> Default for TxCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for TxCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TxCell").field(&*self.inner.value.lock()).finish()
    }
}

// ============================================================================
// TxBuffer
// ============================================================================

struct BufferInner {
    /// Address of byte 0; the boxed slice never moves
    base: usize,
    bytes: Mutex<Box<[u8]>>,
}

impl ByteSlots for BufferInner {
    fn base_addr(&self) -> usize {
        self.base
    }

    fn capture_bytes(&self, offset: usize, len: usize) -> ByteImage {
        let bytes = self.bytes.lock();
        bytes
            .get(offset..offset + len)
            .map(ByteImage::from_slice)
            .unwrap_or_default()
    }

    fn restore_bytes(&self, offset: usize, old: &[u8]) {
        let mut bytes = self.bytes.lock();
        match bytes.get_mut(offset..offset + old.len()) {
            Some(range) => range.copy_from_slice(old),
            None => tracing::error!(target: "rewind::txn", offset, len = old.len(), "buffer restore out of bounds"),
        }
    }
}

/// Fixed-size transactional byte buffer
#[derive(Clone)]
pub struct TxBuffer {
    inner: Arc<BufferInner>,
}

impl TxBuffer {
    /// Create a zeroed buffer of `len` bytes
    pub fn new(len: usize) -> Self {
        Self::from_vec(vec![0; len])
    }

    /// Create a buffer holding `bytes`
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        let bytes = bytes.into_boxed_slice();
        let base = bytes.as_ptr() as usize;
        Self {
            inner: Arc::new(BufferInner {
                base,
                bytes: Mutex::new(bytes),
            }),
        }
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.inner.bytes.lock().len()
    }

    /// Check if the buffer has no bytes
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `len` bytes starting at `offset`
    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let bytes = self.inner.bytes.lock();
        Self::check(bytes.len(), offset, len)?;
        Ok(bytes[offset..offset + len].to_vec())
    }

    /// Copy of the whole buffer
    pub fn to_vec(&self) -> Vec<u8> {
        self.inner.bytes.lock().to_vec()
    }

    /// Overwrite bytes starting at `offset`
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        Self::check(self.len(), offset, data.len())?;
        if data.is_empty() {
            return Ok(());
        }
        self.record(offset, data.len());
        self.inner.bytes.lock()[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Set every byte to `value`
    pub fn fill(&self, value: u8) {
        let len = self.len();
        if len == 0 {
            return;
        }
        self.record(0, len);
        self.inner.bytes.lock().fill(value);
    }

    /// The slot covering `len` bytes at `offset`
    pub fn slot(&self, offset: usize, len: usize) -> Result<SlotRef> {
        Self::check(self.len(), offset, len)?;
        Ok(SlotRef::AuxBuffer {
            buffer: self.inner.clone(),
            offset,
            len,
        })
    }

    fn record(&self, offset: usize, len: usize) {
        context::record_write(|| SlotRef::AuxBuffer {
            buffer: self.inner.clone(),
            offset,
            len,
        });
    }

    fn check(size: usize, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= size => Ok(()),
            _ => Err(RewindError::invalid_input(format!(
                "range {}+{} out of bounds for buffer of {} bytes",
                offset, len, size
            ))),
        }
    }
}

impl fmt::Debug for TxBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxBuffer")
            .field("base", &format_args!("{:#x}", self.inner.base))
            .field("len", &self.len())
            .finish()
    }
}

//! Minimal slot implementations for unit tests

use rewind_core::{CellSlot, SlotKey, SlotRef};
use std::any::Any;
use std::sync::{Arc, Mutex};

struct Inner(Mutex<i64>);

impl CellSlot for Inner {
    fn slot_key(&self) -> SlotKey {
        SlotKey::new(self as *const Inner as usize, std::mem::size_of::<i64>())
    }

    fn capture(&self) -> Box<dyn Any> {
        Box::new(*self.0.lock().unwrap())
    }

    fn restore(&self, old: Box<dyn Any>) {
        if let Ok(v) = old.downcast::<i64>() {
            *self.0.lock().unwrap() = *v;
        }
    }
}

/// An i64 cell; writes are not logged automatically
#[derive(Clone)]
pub(crate) struct TestCell(Arc<Inner>);

impl TestCell {
    pub(crate) fn new(value: i64) -> Self {
        TestCell(Arc::new(Inner(Mutex::new(value))))
    }

    pub(crate) fn slot(&self) -> SlotRef {
        SlotRef::Cell(self.0.clone())
    }

    pub(crate) fn put(&self, value: i64) {
        *self.0 .0.lock().unwrap() = value;
    }

    pub(crate) fn value(&self) -> i64 {
        *self.0 .0.lock().unwrap()
    }
}

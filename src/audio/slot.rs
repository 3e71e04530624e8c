//! Single-slot latest-wins channel
//!
//! The writer overwrites the slot on every publish; readers copy the value
//! out without consuming it. There is never more than one value in flight,
//! so a slow reader sees the newest result and never a backlog. The lock is
//! held only for a copy of a small `Copy` value on either side.

use parking_lot::Mutex;
use std::sync::Arc;

struct Slot<T> {
    value: Mutex<Option<T>>,
}

/// Publishing half, owned by the producer
pub struct SlotWriter<T> {
    slot: Arc<Slot<T>>,
}

/// Peeking half, cloneable
pub struct SlotReader<T> {
    slot: Arc<Slot<T>>,
}

/// Create an empty slot
pub fn latest_slot<T: Copy>() -> (SlotWriter<T>, SlotReader<T>) {
    let slot = Arc::new(Slot {
        value: Mutex::new(None),
    });
    (
        SlotWriter { slot: slot.clone() },
        SlotReader { slot },
    )
}

impl<T: Copy> SlotWriter<T> {
    /// Replace whatever is in the slot. Never waits on readers beyond the copy.
    pub fn publish(&self, value: T) {
        *self.slot.value.lock() = Some(value);
    }
}

impl<T: Copy> SlotReader<T> {
    /// Copy of the latest value, left in place for the next peek
    pub fn peek(&self) -> Option<T> {
        *self.slot.value.lock()
    }
}

impl<T> Clone for SlotReader<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

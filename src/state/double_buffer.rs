//! Double-buffered frame state
//!
//! The extract thread fills the back slot while the render thread reads the
//! front slot; `swap` publishes the back slot at the frame boundary.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

pub struct DoubleBuffer<T> {
    slots: [RwLock<T>; 2],
    /// Index of the slot readers see
    front: AtomicUsize,
    swaps: AtomicU64,
}

impl<T> DoubleBuffer<T> {
    pub fn new(front: T, back: T) -> Self {
        Self {
            slots: [RwLock::new(front), RwLock::new(back)],
            front: AtomicUsize::new(0),
            swaps: AtomicU64::new(0),
        }
    }

    /// Shared access to the published slot
    ///
    /// A swap between picking the slot and locking it sends the reader
    /// around again, so it never holds what is now the back slot.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        loop {
            let front = self.front.load(Ordering::Acquire);
            let guard = self.slots[front].read();
            if self.front.load(Ordering::Acquire) == front {
                return guard;
            }
        }
    }

    /// Exclusive access to the slot being prepared
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        loop {
            let back = self.front.load(Ordering::Acquire) ^ 1;
            let guard = self.slots[back].write();
            if self.front.load(Ordering::Acquire) ^ 1 == back {
                return guard;
            }
        }
    }

    /// Publish the back slot; readers still holding the old front keep it
    /// locked until they drop their guard
    pub fn swap(&self) {
        self.front.fetch_xor(1, Ordering::AcqRel);
        let swaps = self.swaps.fetch_add(1, Ordering::Relaxed) + 1;
        log::trace!("[DoubleBuffer::swap] Published frame {}", swaps);
    }

    pub fn swap_count(&self) -> u64 {
        self.swaps.load(Ordering::Relaxed)
    }
}

impl<T: Default> Default for DoubleBuffer<T> {
    fn default() -> Self {
        Self::new(T::default(), T::default())
    }
}

impl<T: Clone> DoubleBuffer<T> {
    pub fn from_value(value: T) -> Self {
        Self::new(value.clone(), value)
    }
}

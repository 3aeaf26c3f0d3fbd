//! Bounded lock-free multi-producer/multi-consumer ring buffer.
//!
//! This is the only hand-off structure between job submitters and worker
//! threads. It stores boxed items, so a slot pointer is never null while it
//! holds a payload; null marks an empty slot.
//!
//! Two monotonically increasing cursors, `high` (next write) and `low` (next
//! read), are claimed with compare-and-swap. Each slot also carries a stamp
//! telling which lap of the buffer it is ready for, so a producer never
//! overwrites a slot a slow consumer has not emptied yet, and a consumer never
//! takes an item a slow producer has not finished writing.

use crossbeam::utils::{Backoff, CachePadded};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

struct Slot<T> {
    /// `index` when ready to be written for position `index`,
    /// `index + 1` once the item for position `index` is published.
    stamp: AtomicUsize,
    item: AtomicPtr<T>,
}

/// A bounded MPMC queue of boxed items with a power-of-two capacity.
pub struct RingBuffer<T> {
    low: CachePadded<AtomicUsize>,
    high: CachePadded<AtomicUsize>,
    mask: usize,
    slots: Box<[Slot<T>]>,
}

// SAFETY: items are moved in and out as owned boxes; a slot is accessed by
// exactly one producer and one consumer per lap, serialized by the cursors
// and the slot stamp.
unsafe impl<T: Send> Send for RingBuffer<T> {}
unsafe impl<T: Send> Sync for RingBuffer<T> {}

impl<T> RingBuffer<T> {
    /// Creates a ring buffer holding `2^capacity_log2` items.
    pub fn with_capacity_log2(capacity_log2: u32) -> Self {
        assert!(
            capacity_log2 > 0 && capacity_log2 < usize::BITS - 1,
            "ring buffer capacity must be 2^1 or larger"
        );
        let capacity = 1usize << capacity_log2;
        let slots = (0..capacity)
            .map(|i| Slot {
                stamp: AtomicUsize::new(i),
                item: AtomicPtr::new(ptr::null_mut()),
            })
            .collect();

        RingBuffer {
            low: CachePadded::new(AtomicUsize::new(0)),
            high: CachePadded::new(AtomicUsize::new(0)),
            mask: capacity - 1,
            slots,
        }
    }

    /// Maximum number of items the buffer can hold.
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Number of slots claimed by producers and not yet consumed, including
    /// items still being written. Only a snapshot under concurrent use.
    pub fn len(&self) -> usize {
        let low = self.low.load(Ordering::Acquire);
        let high = self.high.load(Ordering::Acquire);
        high.wrapping_sub(low).min(self.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attempts to push `item` without blocking.
    ///
    /// Returns the item back if the buffer is full, if the target slot has
    /// not been emptied yet, or if another producer won the race for it.
    pub fn try_push(&self, item: Box<T>) -> Result<(), Box<T>> {
        // Observe `low` before `high`, so the buffer never looks emptier than it is.
        let low = self.low.load(Ordering::Acquire);
        let high = self.high.load(Ordering::Acquire);

        if high.wrapping_sub(low) >= self.capacity() {
            return Err(item);
        }

        let slot = &self.slots[high & self.mask];
        if slot.stamp.load(Ordering::Acquire) != high {
            // A consumer from the previous lap is still emptying this slot.
            return Err(item);
        }

        if self
            .high
            .compare_exchange(high, high.wrapping_add(1), Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return Err(item);
        }

        let raw = Box::into_raw(item);
        let previous = slot.item.swap(raw, Ordering::Relaxed);
        debug_assert!(previous.is_null(), "ring buffer slot overwritten");
        slot.stamp.store(high.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Attempts to pop the oldest item without blocking.
    ///
    /// Returns `None` if the buffer is empty, if the next item is still being
    /// written, or if another consumer won the race for it.
    pub fn try_pop(&self) -> Option<Box<T>> {
        // Observe `high` before `low`, so the buffer never looks larger than it is.
        let high = self.high.load(Ordering::Acquire);
        let low = self.low.load(Ordering::Acquire);

        if high.wrapping_sub(low) == 0 || high.wrapping_sub(low) > self.capacity() {
            return None;
        }

        let slot = &self.slots[low & self.mask];
        if slot.stamp.load(Ordering::Acquire) != low.wrapping_add(1) {
            return None;
        }
        if slot.item.load(Ordering::Relaxed).is_null() {
            return None;
        }

        if self
            .low
            .compare_exchange(low, low.wrapping_add(1), Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }

        let raw = slot.item.swap(ptr::null_mut(), Ordering::Relaxed);
        debug_assert!(!raw.is_null(), "ring buffer slot empty after claim");
        // Hand the slot to the producer of the next lap.
        slot.stamp
            .store(low.wrapping_add(self.capacity()), Ordering::Release);

        // SAFETY: `raw` came from `Box::into_raw` in `try_push`, and winning
        // the CAS on `low` made this the only consumer of the slot.
        Some(unsafe { Box::from_raw(raw) })
    }

    /// Pushes `item`, spinning until there is room.
    pub fn push(&self, mut item: Box<T>) {
        let backoff = Backoff::new();
        loop {
            match self.try_push(item) {
                Ok(()) => return,
                Err(rejected) => {
                    item = rejected;
                    backoff.snooze();
                }
            }
        }
    }

    /// Pops an item, spinning until one is available.
    pub fn pop(&self) -> Box<T> {
        let backoff = Backoff::new();
        loop {
            if let Some(item) = self.try_pop() {
                return item;
            }
            backoff.snooze();
        }
    }
}

impl<T> Drop for RingBuffer<T> {
    fn drop(&mut self) {
        while self.try_pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_basic() {
        let rb = RingBuffer::with_capacity_log2(2);
        assert_eq!(rb.capacity(), 4);
        assert!(rb.is_empty());

        rb.try_push(Box::new(7)).unwrap();
        rb.try_push(Box::new(8)).unwrap();
        assert_eq!(rb.len(), 2);

        assert_eq!(*rb.try_pop().unwrap(), 7);
        assert_eq!(*rb.try_pop().unwrap(), 8);
        assert!(rb.try_pop().is_none());
    }

    #[test]
    fn test_full_buffer_rejects_push() {
        let rb = RingBuffer::with_capacity_log2(3);
        for i in 0..8 {
            rb.try_push(Box::new(i)).unwrap();
        }
        let rejected = rb.try_push(Box::new(100)).unwrap_err();
        assert_eq!(*rejected, 100);

        assert_eq!(*rb.try_pop().unwrap(), 0);
        rb.try_push(Box::new(100)).unwrap();
        assert_eq!(rb.len(), 8);
    }

    #[test]
    fn test_wraps_around_many_laps() {
        let rb = RingBuffer::with_capacity_log2(1);
        for i in 0..1000u32 {
            rb.push(Box::new(i));
            assert_eq!(*rb.pop(), i);
        }
        assert!(rb.is_empty());
    }

    #[test]
    fn test_drop_frees_leftovers() {
        use std::sync::Arc;

        let marker = Arc::new(());
        {
            let rb = RingBuffer::with_capacity_log2(4);
            for _ in 0..5 {
                rb.push(Box::new(marker.clone()));
            }
            assert_eq!(Arc::strong_count(&marker), 6);
        }
        assert_eq!(Arc::strong_count(&marker), 1);
    }
}

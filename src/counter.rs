//! Completion counters and the registry that owns them.
//!
//! A counter tracks how many jobs of one submitted batch are still
//! unfinished. Each queued job holds a reference to its batch counter and
//! decrements it exactly once, after its function returned. Waiters join on
//! the counter reaching a target value (usually zero).
//!
//! Counters are handed out to callers as [`CounterHandle`]s: a slot index
//! plus a generation. Freeing a counter bumps the generation of its slot, so
//! a handle that was already waited on is detected instead of silently
//! aliasing a newer counter.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// An atomic count of unfinished jobs.
#[derive(Debug)]
pub struct Counter {
    value: AtomicU32,
}

impl Counter {
    /// Creates a new counter with the specified initial value.
    pub fn new(initial: u32) -> Self {
        Counter {
            value: AtomicU32::new(initial),
        }
    }

    /// Returns the current value of the counter.
    pub fn value(&self) -> u32 {
        self.value.load(Ordering::Acquire)
    }

    /// Decrements the counter by one and returns the new value.
    ///
    /// Release ordering makes everything the finished job wrote visible to
    /// whoever observes the new value.
    ///
    /// # Panics
    ///
    /// Panics if the counter is already zero: more jobs completed than the
    /// batch contained.
    pub fn decrement(&self) -> u32 {
        let previous = self.value.fetch_sub(1, Ordering::Release);
        assert!(previous != 0, "completion counter decremented below zero");
        previous - 1
    }

    /// Checks whether the counter has come down to `target`.
    ///
    /// The value only ever decreases, so a counter that already went below
    /// `target` has reached it too.
    pub fn reached(&self, target: u32) -> bool {
        self.value() <= target
    }

    /// Checks if the counter has reached zero.
    pub fn is_complete(&self) -> bool {
        self.reached(0)
    }
}

/// Opaque handle to a registered completion counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CounterHandle {
    index: u32,
    generation: u32,
}

impl CounterHandle {
    /// Packs the handle into a single integer, for the C ABI.
    pub fn to_bits(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    /// Rebuilds a handle packed with [`CounterHandle::to_bits`].
    pub fn from_bits(bits: u64) -> Self {
        CounterHandle {
            index: bits as u32,
            generation: (bits >> 32) as u32,
        }
    }
}

struct Slot {
    generation: u32,
    counter: Option<Arc<Counter>>,
}

#[derive(Default)]
struct RegistryInner {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

/// Mutex-guarded slot table of live counters.
///
/// This is an administrative structure touched once per batch on submit and
/// once on free; the per-job hot path only touches the counter's atomic.
#[derive(Default)]
pub struct CounterRegistry {
    inner: Mutex<RegistryInner>,
}

impl CounterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new counter initialised to `initial`.
    pub fn allocate(&self, initial: u32) -> (CounterHandle, Arc<Counter>) {
        let counter = Arc::new(Counter::new(initial));
        let mut inner = self.lock();

        let index = match inner.free.pop() {
            Some(index) => index,
            None => {
                let index = u32::try_from(inner.slots.len())
                    .expect("counter registry exceeded u32::MAX slots");
                inner.slots.push(Slot {
                    generation: 0,
                    counter: None,
                });
                index
            }
        };

        let slot = &mut inner.slots[index as usize];
        debug_assert!(slot.counter.is_none());
        slot.counter = Some(counter.clone());
        let handle = CounterHandle {
            index,
            generation: slot.generation,
        };
        inner.live += 1;

        (handle, counter)
    }

    /// Looks up a live counter. Returns `None` for stale or unknown handles.
    pub fn get(&self, handle: CounterHandle) -> Option<Arc<Counter>> {
        let inner = self.lock();
        inner
            .slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.counter.clone())
    }

    /// Removes a counter from the registry. Returns `None` if the handle is
    /// stale (already freed) or unknown.
    pub fn free(&self, handle: CounterHandle) -> Option<Arc<Counter>> {
        let mut inner = self.lock();
        let slot = inner
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)?;
        let counter = slot.counter.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        inner.free.push(handle.index);
        inner.live -= 1;
        Some(counter)
    }

    /// Number of counters not yet freed.
    pub fn live(&self) -> usize {
        self.lock().live
    }

    /// Frees every counter still registered and returns how many there were.
    pub fn clear(&self) -> usize {
        let mut inner = self.lock();
        let leftover = inner.live;
        let RegistryInner { slots, free, live } = &mut *inner;
        for (index, slot) in slots.iter_mut().enumerate() {
            if slot.counter.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                free.push(index as u32);
            }
        }
        *live = 0;
        leftover
    }
}

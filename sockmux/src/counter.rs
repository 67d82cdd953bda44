//! Per-thread sharded counters.
//!
//! Listener threads bump byte and connection counters on every event. Each
//! listener writes its own cache-line-padded cell; readers add the cells up.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

const SHARDS: usize = 16;

thread_local! {
    static SHARD: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Assign the calling thread to shard `id % 16`. Listener threads call this
/// once at startup.
pub fn set_thread_shard(id: usize) {
    SHARD.set(Some(id % SHARDS));
}

/// Cell index for the calling thread. Threads without an assigned shard
/// (acceptors, application threads) spread by thread-local address.
#[inline]
fn current_shard() -> usize {
    if let Some(shard) = SHARD.get() {
        return shard;
    }
    thread_local! {
        static ANCHOR: u8 = const { 0 };
    }
    ANCHOR.with(|a| (a as *const u8 as usize >> 6) % SHARDS)
}

#[repr(align(64))]
struct Cell64(AtomicU64);

/// A monotonically increasing counter with one cell per shard.
pub struct Counter {
    cells: [Cell64; SHARDS],
}

impl Counter {
    #[allow(clippy::declare_interior_mutable_const)]
    pub const fn new() -> Self {
        const EMPTY: Cell64 = Cell64(AtomicU64::new(0));
        Counter {
            cells: [EMPTY; SHARDS],
        }
    }

    #[inline]
    pub fn increment(&self) {
        self.add(1);
    }

    #[inline]
    pub fn add(&self, n: u64) {
        self.cells[current_shard()].0.fetch_add(n, Ordering::Relaxed);
    }

    /// Sum over every shard.
    pub fn value(&self) -> u64 {
        self.cells
            .iter()
            .map(|c| c.0.load(Ordering::Relaxed))
            .fold(0u64, u64::wrapping_add)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

impl metriken::Metric for Counter {
    fn as_any(&self) -> Option<&dyn std::any::Any> {
        Some(self)
    }

    fn value(&self) -> Option<metriken::Value<'_>> {
        Some(metriken::Value::Counter(Counter::value(self)))
    }
}

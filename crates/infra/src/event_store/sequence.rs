//! Global sequence allocation for the in-process store.

use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};

/// Strictly monotonic allocator of global sequence numbers.
///
/// The allocator only hands out numbers; making allocation and publication of
/// the log entry one atomic step is the caller's job. `InMemoryEventStore`
/// calls [`SequenceAllocator::allocate`] while holding its global log lock, so
/// readers never observe sequence `n + 1` before `n`.
///
/// The Postgres store allocates from the `event_sequence` row instead, inside
/// the append transaction.
#[derive(Debug, Default)]
pub struct SequenceAllocator {
    last: AtomicU64,
}

impl SequenceAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume after an already-used position.
    pub fn starting_after(last: u64) -> Self {
        Self {
            last: AtomicU64::new(last),
        }
    }

    /// Reserve `count` consecutive numbers. `count` must be non-zero.
    pub fn allocate(&self, count: u64) -> RangeInclusive<u64> {
        debug_assert!(count > 0, "allocating an empty range");
        let previous = self.last.fetch_add(count, Ordering::AcqRel);
        (previous + 1)..=(previous + count)
    }

    /// Last number handed out (0 if none).
    pub fn last(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn ranges_are_consecutive() {
        let alloc = SequenceAllocator::new();
        assert_eq!(alloc.allocate(3), 1..=3);
        assert_eq!(alloc.allocate(1), 4..=4);
        assert_eq!(alloc.last(), 4);
        assert_eq!(SequenceAllocator::starting_after(41).allocate(2), 42..=43);
    }

    #[test]
    fn concurrent_allocation_never_reuses_numbers() {
        let alloc = Arc::new(SequenceAllocator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let alloc = Arc::clone(&alloc);
                std::thread::spawn(move || {
                    (0..500).flat_map(|_| alloc.allocate(2)).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (1..=8000).collect::<Vec<_>>());
    }
}

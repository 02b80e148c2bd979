//! Diagnostic counters for one allocator instance.
//!
//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. A snapshot taken while other threads allocate may be
//! transiently inconsistent (e.g. more chunks freed than allocated if the
//! reads straddle a free). This is acceptable for diagnostic display.
//! Do NOT use these values for allocation decisions.

use crate::sync::atomic::{AtomicU64, Ordering};
use std::fmt;

/// Monotonic event counter.
pub(crate) struct Counter(AtomicU64);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(val as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr(&self) {
        self.add(1);
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Live counters embedded in a `BinAllocator`.
pub(crate) struct StatCounters {
    pub pages_mapped: Counter,
    pub pages_unmapped: Counter,
    pub chunks_allocated: Counter,
    pub chunks_freed: Counter,
    pub large_allocations: Counter,
    pub arenas: Counter,
    pub unlinks_abandoned: Counter,
}

impl StatCounters {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self {
            pages_mapped: Counter::new(),
            pages_unmapped: Counter::new(),
            chunks_allocated: Counter::new(),
            chunks_freed: Counter::new(),
            large_allocations: Counter::new(),
            arenas: Counter::new(),
            unlinks_abandoned: Counter::new(),
        }
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self {
            pages_mapped: Counter::new(),
            pages_unmapped: Counter::new(),
            chunks_allocated: Counter::new(),
            chunks_freed: Counter::new(),
            large_allocations: Counter::new(),
            arenas: Counter::new(),
            unlinks_abandoned: Counter::new(),
        }
    }

    pub fn snapshot(&self) -> BinStats {
        BinStats {
            pages_mapped: self.pages_mapped.get(),
            pages_unmapped: self.pages_unmapped.get(),
            chunks_allocated: self.chunks_allocated.get(),
            chunks_freed: self.chunks_freed.get(),
            large_allocations: self.large_allocations.get(),
            arenas: self.arenas.get(),
            unlinks_abandoned: self.unlinks_abandoned.get(),
        }
    }
}

/// Point-in-time copy of an allocator's counters.
///
/// Pages are OS pages; a large allocation counts every page of its mapping.
/// Chunk counters include large allocations (one chunk each).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BinStats {
    pub pages_mapped: u64,
    pub pages_unmapped: u64,
    pub chunks_allocated: u64,
    pub chunks_freed: u64,
    pub large_allocations: u64,
    /// Thread arenas registered so far. Arenas are never torn down.
    pub arenas: u64,
    /// Empty bins left linked because an unlink lost a lock race.
    pub unlinks_abandoned: u64,
}

impl BinStats {
    /// Pages currently mapped by the allocator.
    #[must_use]
    pub fn pages_resident(&self) -> u64 {
        self.pages_mapped.saturating_sub(self.pages_unmapped)
    }

    /// Chunks currently handed out.
    #[must_use]
    pub fn chunks_live(&self) -> u64 {
        self.chunks_allocated.saturating_sub(self.chunks_freed)
    }
}

impl fmt::Display for BinStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "== binmalloc stats ==")?;
        writeln!(f, "Pages mapped:       {:>10}", self.pages_mapped)?;
        writeln!(f, "Pages unmapped:     {:>10}", self.pages_unmapped)?;
        writeln!(f, "Chunks allocated:   {:>10}", self.chunks_allocated)?;
        writeln!(f, "Chunks freed:       {:>10}", self.chunks_freed)?;
        writeln!(f, "Large allocations:  {:>10}", self.large_allocations)?;
        writeln!(f, "Thread arenas:      {:>10}", self.arenas)?;
        write!(f, "Unlinks abandoned:  {:>10}", self.unlinks_abandoned)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_counter_add_get() {
        let counter = Counter::new();
        counter.add(10);
        counter.incr();
        assert_eq!(counter.get(), 11);
    }

    #[test]
    fn test_snapshot_derived_values() {
        let counters = StatCounters::new();
        counters.pages_mapped.add(5);
        counters.pages_unmapped.add(2);
        counters.chunks_allocated.add(7);
        counters.chunks_freed.add(3);
        let snap = counters.snapshot();
        assert_eq!(snap.pages_resident(), 3);
        assert_eq!(snap.chunks_live(), 4);
    }

    #[test]
    fn test_derived_values_saturate() {
        let snap = BinStats {
            chunks_freed: 2,
            ..BinStats::default()
        };
        assert_eq!(snap.chunks_live(), 0);
    }

    #[test]
    fn test_display_lists_counters() {
        let snap = BinStats {
            pages_mapped: 4,
            ..BinStats::default()
        };
        let text = snap.to_string();
        assert!(text.contains("Pages mapped:"));
        assert!(text.contains('4'));
        assert!(text.contains("Unlinks abandoned:"));
    }
}

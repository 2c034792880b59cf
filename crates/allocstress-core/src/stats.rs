//! Detailed allocation statistics.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Point-in-time allocator counters.
///
/// "Virtual" counters cover blocks served from page-granular mappings
/// rather than size-classed storage. Diagnostic only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStatistics {
    pub allocations_current: u64,
    pub allocations_total: u64,
    pub allocated_current: u64,
    pub allocated_total: u64,
    pub allocations_current_virtual: u64,
    pub allocations_total_virtual: u64,
    pub allocated_current_virtual: u64,
    pub allocated_total_virtual: u64,
}

impl MemoryStatistics {
    /// Returns true if no block of either category is outstanding.
    #[must_use]
    pub fn is_quiescent(&self) -> bool {
        self.allocations_current == 0 && self.allocations_current_virtual == 0
    }
}

#[derive(Default)]
struct CategoryCounters {
    count_current: AtomicU64,
    count_total: AtomicU64,
    bytes_current: AtomicU64,
    bytes_total: AtomicU64,
}

impl CategoryCounters {
    fn add(&self, bytes: u64) {
        self.count_current.fetch_add(1, Ordering::Relaxed);
        self.count_total.fetch_add(1, Ordering::Relaxed);
        self.bytes_current.fetch_add(bytes, Ordering::Relaxed);
        self.bytes_total.fetch_add(bytes, Ordering::Relaxed);
    }

    fn remove(&self, bytes: u64) {
        self.count_current.fetch_sub(1, Ordering::Relaxed);
        self.bytes_current.fetch_sub(bytes, Ordering::Relaxed);
    }
}

/// Lock-free counter block backing [`MemoryStatistics`].
#[derive(Default)]
pub(crate) struct StatisticsCounters {
    regular: CategoryCounters,
    virtual_backed: CategoryCounters,
}

impl StatisticsCounters {
    pub(crate) fn record_alloc(&self, bytes: usize, virtual_backed: bool) {
        self.category(virtual_backed).add(bytes as u64);
    }

    pub(crate) fn record_free(&self, bytes: usize, virtual_backed: bool) {
        self.category(virtual_backed).remove(bytes as u64);
    }

    fn category(&self, virtual_backed: bool) -> &CategoryCounters {
        if virtual_backed {
            &self.virtual_backed
        } else {
            &self.regular
        }
    }

    pub(crate) fn snapshot(&self) -> MemoryStatistics {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MemoryStatistics {
            allocations_current: load(&self.regular.count_current),
            allocations_total: load(&self.regular.count_total),
            allocated_current: load(&self.regular.bytes_current),
            allocated_total: load(&self.regular.bytes_total),
            allocations_current_virtual: load(&self.virtual_backed.count_current),
            allocations_total_virtual: load(&self.virtual_backed.count_total),
            allocated_current_virtual: load(&self.virtual_backed.bytes_current),
            allocated_total_virtual: load(&self.virtual_backed.bytes_total),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_split_by_category() {
        let counters = StatisticsCounters::default();
        counters.record_alloc(100, false);
        counters.record_alloc(40_000, true);
        counters.record_free(100, false);

        let snap = counters.snapshot();
        assert_eq!(snap.allocations_current, 0);
        assert_eq!(snap.allocations_total, 1);
        assert_eq!(snap.allocated_total, 100);
        assert_eq!(snap.allocations_current_virtual, 1);
        assert_eq!(snap.allocated_current_virtual, 40_000);
        assert!(!snap.is_quiescent());
    }

    #[test]
    fn snapshot_serializes_all_fields() {
        let json = serde_json::to_value(MemoryStatistics::default()).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), 8);
        assert_eq!(obj["allocated_total_virtual"], 0);
    }
}

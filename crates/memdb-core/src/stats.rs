//! Performance counters and memory statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Lock-free operation counter: totals accumulate with atomic fetch-add.
#[derive(Debug, Default)]
pub struct PerfStatCounter {
    total_count: AtomicU64,
    total_time_us: AtomicU64,
}

impl PerfStatCounter {
    pub fn hit(&self, elapsed: Duration) {
        self.total_count.fetch_add(1, Ordering::Relaxed);
        self.total_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PerfStat {
        let total_count = self.total_count.load(Ordering::Relaxed);
        let total_time_us = self.total_time_us.load(Ordering::Relaxed);
        PerfStat {
            total_count,
            total_time_us,
            avg_time_us: if total_count > 0 {
                total_time_us / total_count
            } else {
                0
            },
        }
    }
}

/// Snapshot of one operation class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerfStat {
    pub total_count: u64,
    pub total_time_us: u64,
    pub avg_time_us: u64,
}

/// Per-namespace performance snapshot.
#[derive(Debug, Clone, Default)]
pub struct NamespacePerfStat {
    pub name: String,
    pub selects: PerfStat,
    pub updates: PerfStat,
}

/// Memory footprint of one index.
#[derive(Debug, Clone)]
pub struct IndexMemStat {
    pub name: String,
    pub unique_keys: usize,
    pub data_size: usize,
}

/// Per-namespace memory snapshot.
#[derive(Debug, Clone, Default)]
pub struct NamespaceMemStat {
    pub name: String,
    pub items_count: usize,
    pub free_count: usize,
    pub data_size: usize,
    pub indexes: Vec<IndexMemStat>,
    pub query_cache_size: usize,
    pub join_cache_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_avg() {
        let counter = PerfStatCounter::default();
        counter.hit(Duration::from_micros(100));
        counter.hit(Duration::from_micros(300));
        let stat = counter.snapshot();
        assert_eq!(stat.total_count, 2);
        assert_eq!(stat.total_time_us, 400);
        assert_eq!(stat.avg_time_us, 200);
    }

    #[test]
    fn test_empty_counter() {
        let counter = PerfStatCounter::default();
        assert_eq!(counter.snapshot().avg_time_us, 0);
    }
}

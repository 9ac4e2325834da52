//! Lightweight atomic counters, in the spirit of mimalloc's `Stats`: enough
//! to drive the two public space reports plus a handful of diagnostics
//! worth logging at shutdown. Not a metrics subsystem -- no export format,
//! no histogram, just running counts.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

#[derive(Default)]
pub struct StatCount {
    pub current: AtomicI64,
    pub peak: AtomicI64,
}

impl StatCount {
    pub fn increase(&self, amount: i64) {
        if amount == 0 {
            return;
        }
        let current = self.current.fetch_add(amount, Ordering::Relaxed) + amount;
        let mut peak = self.peak.load(Ordering::Relaxed);
        while current > peak {
            match self
                .peak
                .compare_exchange_weak(peak, current, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(observed) => peak = observed,
            }
        }
    }

    pub fn decrease(&self, amount: i64) {
        self.increase(-amount);
    }

    pub fn get(&self) -> i64 {
        self.current.load(Ordering::Relaxed)
    }
}

/// Process-wide allocator diagnostics. Not part of the documented public
/// surface (see `report_free_bytes`/`report_total_bytes` on `Manager` for
/// that); exposed for logging at shutdown and for tests.
#[derive(Default)]
pub struct Stats {
    pub regions: StatCount,
    pub reserved_bytes: StatCount,
    pub segments_small: StatCount,
    pub segments_large: StatCount,
    pub segments_container: StatCount,
    pub reclaimed_pools: AtomicUsize,
    pub allocations: AtomicUsize,
    pub frees: AtomicUsize,
}

impl Stats {
    pub fn record_alloc(&self) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_free(&self) {
        self.frees.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reclaim(&self) {
        self.reclaimed_pools.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_count_tracks_peak() {
        let s = StatCount::default();
        s.increase(10);
        s.increase(5);
        s.decrease(8);
        assert_eq!(s.get(), 7);
        assert_eq!(s.peak.load(Ordering::Relaxed), 15);
    }
}

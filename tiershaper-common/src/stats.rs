use core::sync::atomic::{AtomicU64, Ordering::Relaxed};

use crate::ShapingFault;

/// Relaxed packet counters for one direction or one entity
#[repr(C)]
#[derive(Debug, Default)]
pub struct ShapeStats {
    pub packets_total: AtomicU64,
    pub bytes_total: AtomicU64,
    pub packets_dropped: AtomicU64,
    pub bytes_dropped: AtomicU64,
    /// Admitted with a departure stamp moved into the future
    pub packets_paced: AtomicU64,
    /// Admitted because a stage could not run
    pub packets_fail_open: AtomicU64,
    pub faults: [AtomicU64; ShapingFault::COUNT],
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub packets_total: u64,
    pub bytes_total: u64,
    pub packets_dropped: u64,
    pub bytes_dropped: u64,
    pub packets_paced: u64,
    pub packets_fail_open: u64,
    pub faults: [u64; ShapingFault::COUNT],
}

impl ShapeStats {
    pub const fn new() -> Self {
        Self {
            packets_total: AtomicU64::new(0),
            bytes_total: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            bytes_dropped: AtomicU64::new(0),
            packets_paced: AtomicU64::new(0),
            packets_fail_open: AtomicU64::new(0),
            faults: [const { AtomicU64::new(0) }; ShapingFault::COUNT],
        }
    }

    #[inline(always)]
    pub fn record_seen(&self, bytes: u64) {
        self.packets_total.fetch_add(1, Relaxed);
        self.bytes_total.fetch_add(bytes, Relaxed);
    }

    #[inline(always)]
    pub fn record_drop(&self, bytes: u64) {
        self.packets_dropped.fetch_add(1, Relaxed);
        self.bytes_dropped.fetch_add(bytes, Relaxed);
    }

    #[inline(always)]
    pub fn record_paced(&self) {
        self.packets_paced.fetch_add(1, Relaxed);
    }

    #[inline(always)]
    pub fn record_fail_open(&self) {
        self.packets_fail_open.fetch_add(1, Relaxed);
    }

    #[inline(always)]
    pub fn record_fault(&self, fault: ShapingFault) {
        self.faults[fault.index()].fetch_add(1, Relaxed);
    }

    pub fn reset(&self) {
        for counter in [
            &self.packets_total,
            &self.bytes_total,
            &self.packets_dropped,
            &self.bytes_dropped,
            &self.packets_paced,
            &self.packets_fail_open,
        ] {
            counter.store(0, Relaxed);
        }
        for counter in &self.faults {
            counter.store(0, Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let mut faults = [0; ShapingFault::COUNT];
        for (out, counter) in faults.iter_mut().zip(&self.faults) {
            *out = counter.load(Relaxed);
        }
        StatsSnapshot {
            packets_total: self.packets_total.load(Relaxed),
            bytes_total: self.bytes_total.load(Relaxed),
            packets_dropped: self.packets_dropped.load(Relaxed),
            bytes_dropped: self.bytes_dropped.load(Relaxed),
            packets_paced: self.packets_paced.load(Relaxed),
            packets_fail_open: self.packets_fail_open.load(Relaxed),
            faults,
        }
    }
}

impl StatsSnapshot {
    pub fn packets_admitted(&self) -> u64 {
        self.packets_total.saturating_sub(self.packets_dropped)
    }

    pub fn bytes_admitted(&self) -> u64 {
        self.bytes_total.saturating_sub(self.bytes_dropped)
    }

    pub fn fault(&self, fault: ShapingFault) -> u64 {
        self.faults[fault.index()]
    }

    /// Counter deltas since `earlier`
    pub fn since(&self, earlier: &StatsSnapshot) -> StatsSnapshot {
        let mut faults = [0; ShapingFault::COUNT];
        for (i, out) in faults.iter_mut().enumerate() {
            *out = self.faults[i].saturating_sub(earlier.faults[i]);
        }
        StatsSnapshot {
            packets_total: self.packets_total.saturating_sub(earlier.packets_total),
            bytes_total: self.bytes_total.saturating_sub(earlier.bytes_total),
            packets_dropped: self.packets_dropped.saturating_sub(earlier.packets_dropped),
            bytes_dropped: self.bytes_dropped.saturating_sub(earlier.bytes_dropped),
            packets_paced: self.packets_paced.saturating_sub(earlier.packets_paced),
            packets_fail_open: self
                .packets_fail_open
                .saturating_sub(earlier.packets_fail_open),
            faults,
        }
    }
}

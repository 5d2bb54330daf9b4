use core::sync::atomic::{AtomicU64, Ordering::Relaxed};

use crate::{NSEC_PER_MSEC, NSEC_PER_SEC};

/// Number of published epochs kept per direction
pub const RING_SLOTS: usize = 10;

/// Accounting window for a single epoch
pub const EPOCH_NS: u64 = 100 * NSEC_PER_MSEC;

/// Epochs longer than this were idle gaps; their rate is meaningless
pub const STALE_EPOCH_NS: u64 = 300 * NSEC_PER_MSEC;

/// Published slots older than this are left out of the average
pub const FRESHNESS_NS: u64 = 1200 * NSEC_PER_MSEC;

/// One ring entry. For the open epoch `val` is accumulated bytes; for a
/// published slot it is the epoch's rate in bytes per second.
#[repr(C)]
#[derive(Debug)]
pub struct NetStat {
    /// Generation of the epoch (0 = never written)
    pub index: AtomicU64,
    /// Window start in nanoseconds
    pub ts: AtomicU64,
    pub val: AtomicU64,
}

impl NetStat {
    pub const fn new() -> Self {
        Self {
            index: AtomicU64::new(0),
            ts: AtomicU64::new(0),
            val: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> SlotSnapshot {
        SlotSnapshot {
            index: self.index.load(Relaxed),
            ts: self.ts.load(Relaxed),
            val: self.val.load(Relaxed),
        }
    }
}

impl Default for NetStat {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub index: u64,
    pub ts: u64,
    pub val: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingSnapshot {
    pub open: SlotSnapshot,
    pub slots: [SlotSnapshot; RING_SLOTS],
}

/// Sliding-window throughput estimator for one direction.
///
/// `meta` is the epoch being accumulated; its `index` is the generation
/// that will be published next. Published epochs land in
/// `slots[(generation - 1) % RING_SLOTS]`.
#[repr(C)]
#[derive(Debug)]
pub struct RateRing {
    meta: NetStat,
    slots: [NetStat; RING_SLOTS],
}

impl RateRing {
    pub const fn new() -> Self {
        Self {
            meta: NetStat::new(),
            slots: [const { NetStat::new() }; RING_SLOTS],
        }
    }

    /// Account `bytes` transferred at `now`
    #[inline(always)]
    pub fn record(&self, bytes: u64, now: u64) {
        let generation = self.meta.index.load(Relaxed);
        if generation == 0 {
            self.meta.ts.store(now, Relaxed);
            self.meta.val.store(bytes, Relaxed);
            self.meta.index.store(1, Relaxed);
            return;
        }

        let window_start = self.meta.ts.load(Relaxed);
        let accumulated = self.meta.val.load(Relaxed);
        let elapsed = now.saturating_sub(window_start);

        if elapsed < EPOCH_NS {
            self.meta.val.store(accumulated.saturating_add(bytes), Relaxed);
            return;
        }

        // Close the epoch; this packet opens the next one
        self.meta.ts.store(now, Relaxed);
        self.meta.val.store(bytes, Relaxed);

        let rate = if elapsed > STALE_EPOCH_NS {
            0
        } else {
            let rate = accumulated as u128 * NSEC_PER_SEC as u128 / elapsed as u128;
            u64::try_from(rate).unwrap_or(u64::MAX)
        };

        let slot = &self.slots[((generation - 1) % RING_SLOTS as u64) as usize];
        slot.val.store(rate, Relaxed);
        slot.ts.store(window_start, Relaxed);
        slot.index.store(generation, Relaxed);

        self.meta.index.store(generation.wrapping_add(1).max(1), Relaxed);
    }

    /// Smoothed rate in bytes per second.
    ///
    /// Stale slots count as zero and the sum is always divided by the full
    /// slot count, so idle or bursty periods pull the estimate down.
    pub fn average(&self, now: u64) -> u64 {
        let mut total: u64 = 0;
        for slot in &self.slots {
            if slot.index.load(Relaxed) == 0 {
                continue;
            }
            if now.saturating_sub(slot.ts.load(Relaxed)) < FRESHNESS_NS {
                total = total.saturating_add(slot.val.load(Relaxed));
            }
        }
        total / RING_SLOTS as u64
    }

    pub fn snapshot(&self) -> RingSnapshot {
        let mut slots = [SlotSnapshot::default(); RING_SLOTS];
        for (out, slot) in slots.iter_mut().zip(&self.slots) {
            *out = slot.snapshot();
        }
        RingSnapshot {
            open: self.meta.snapshot(),
            slots,
        }
    }
}

impl Default for RateRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1_000_000;

    /// Feed a steady `rate` for `duration_ns`, one record per millisecond
    fn feed(ring: &RateRing, start: u64, duration_ns: u64, rate: u64) -> u64 {
        let step = NSEC_PER_MSEC;
        let per_step = rate / 1000;
        let mut now = start;
        while now < start + duration_ns {
            ring.record(per_step, now);
            now += step;
        }
        now
    }

    #[test]
    fn test_steady_rate_estimate() {
        let ring = RateRing::new();
        let now = feed(&ring, 0, 2 * NSEC_PER_SEC, 50 * MB);
        let avg = ring.average(now);
        // Every published epoch spans 100ms of 50 MB/s traffic
        assert!(avg >= 49 * MB && avg <= 51 * MB, "avg = {avg}");
    }

    #[test]
    fn test_partial_ring_is_biased_down() {
        let ring = RateRing::new();
        // Three epochs published, the rest of the ring never written
        let now = feed(&ring, 0, 350 * NSEC_PER_MSEC, 10 * MB);
        assert_eq!(ring.snapshot().open.index, 4);
        let avg = ring.average(now);
        assert!(avg <= 3 * MB + MB / 10, "avg = {avg}");
        assert!(avg >= 3 * MB - MB / 10, "avg = {avg}");
    }

    #[test]
    fn test_decay_after_silence() {
        let ring = RateRing::new();
        let start = NSEC_PER_SEC;
        ring.record(MB, start);
        ring.record(MB, start + 150 * NSEC_PER_MSEC);
        assert!(ring.average(start + 200 * NSEC_PER_MSEC) > 0);

        assert_eq!(ring.average(start + 2 * NSEC_PER_SEC + 200 * NSEC_PER_MSEC), 0);
    }

    #[test]
    fn test_single_sample_then_silence() {
        let ring = RateRing::new();
        ring.record(MB, 0);
        assert_eq!(ring.average(2 * NSEC_PER_SEC), 0);
    }

    #[test]
    fn test_idle_gap_publishes_zero() {
        let ring = RateRing::new();
        ring.record(5 * MB, 0);
        // 400ms later: the epoch is too long to mean anything
        ring.record(1000, 400 * NSEC_PER_MSEC);
        let snap = ring.snapshot();
        assert_eq!(snap.slots[0].index, 1);
        assert_eq!(snap.slots[0].val, 0);
        assert_eq!(snap.open.val, 1000);
    }

    #[test]
    fn test_epoch_rate_excludes_closing_packet() {
        let ring = RateRing::new();
        ring.record(1_000_000, 0);
        ring.record(9_999, 200 * NSEC_PER_MSEC);
        let snap = ring.snapshot();
        // 1 MB over 200ms
        assert_eq!(snap.slots[0].val, 5 * MB);
        assert_eq!(snap.slots[0].ts, 0);
        assert_eq!(snap.open.val, 9_999);
        assert_eq!(snap.open.ts, 200 * NSEC_PER_MSEC);
    }

    #[test]
    fn test_ring_wraps() {
        let ring = RateRing::new();
        let mut now = 0;
        for _ in 0..(RING_SLOTS * 2 + 3) {
            ring.record(1000, now);
            now += EPOCH_NS;
        }
        let snap = ring.snapshot();
        assert_eq!(snap.open.index, (RING_SLOTS * 2 + 3) as u64);
        let newest = snap.slots.iter().map(|s| s.index).max().unwrap();
        assert_eq!(newest, (RING_SLOTS * 2 + 2) as u64);
        assert!(snap.slots.iter().all(|s| s.index > RING_SLOTS as u64));
    }
}

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering::Relaxed};

use crate::estimator::RateRing;
use crate::limiter::{LimiterSnapshot, LimiterState};
use crate::{MEGABYTE, NSEC_PER_SEC, Tier, UNSET};

/// Minimum spacing between two allocator runs
pub const ADJUST_INTERVAL_NS: u64 = NSEC_PER_SEC;

#[repr(C)]
#[derive(Debug, Default)]
pub struct TierBounds {
    pub min_bps: AtomicU64,
    pub max_bps: AtomicU64,
}

/// Global rate configuration for one direction.
///
/// Written field by field by the control plane; readers may observe a mix
/// of old and new fields and must cope.
#[repr(C)]
#[derive(Debug, Default)]
pub struct GlobalRateCfg {
    /// Non-zero once the control plane has written a usable config
    pub configured: AtomicU32,
    /// Hardware ceiling (guaranteed bandwidth) in bytes per second
    pub hw_bps: AtomicU64,
    pub hw_burstable_bps: AtomicU64,
    pub tiers: [TierBounds; 3],
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateCfgSnapshot {
    pub configured: bool,
    pub hw_bps: u64,
    pub hw_burstable_bps: u64,
    /// (min, max) per tier
    pub tiers: [(u64, u64); 3],
}

impl GlobalRateCfg {
    pub fn is_configured(&self) -> bool {
        self.configured.load(Relaxed) != 0
    }

    pub fn set_configured(&self, configured: bool) {
        self.configured.store(configured as u32, Relaxed);
    }

    pub fn hw_bps(&self) -> u64 {
        self.hw_bps.load(Relaxed)
    }

    pub fn bounds(&self, tier: Tier) -> (u64, u64) {
        let b = &self.tiers[tier.index()];
        (b.min_bps.load(Relaxed), b.max_bps.load(Relaxed))
    }

    pub fn snapshot(&self) -> RateCfgSnapshot {
        let mut tiers = [(0, 0); 3];
        for tier in Tier::ALL {
            tiers[tier.index()] = self.bounds(tier);
        }
        RateCfgSnapshot {
            configured: self.is_configured(),
            hw_bps: self.hw_bps.load(Relaxed),
            hw_burstable_bps: self.hw_burstable_bps.load(Relaxed),
            tiers,
        }
    }
}

/// Live tier bandwidths for one direction plus their pacing bookkeeping.
///
/// Each tier's `LimiterState::bps` is the currently allowed bandwidth; the
/// allocator rewrites it, the global admission stage consumes it.
#[repr(C)]
#[derive(Debug)]
pub struct TierState {
    /// Last allocator run; `UNSET` until the first packet of the direction
    pub last_adjusted: AtomicU64,
    pub tiers: [LimiterState; 3],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierSnapshot {
    pub last_adjusted: u64,
    pub tiers: [LimiterSnapshot; 3],
}

impl TierState {
    pub const fn new() -> Self {
        Self {
            last_adjusted: AtomicU64::new(UNSET),
            tiers: [const { LimiterState::new(0) }; 3],
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.last_adjusted.load(Relaxed) != UNSET
    }

    pub fn limiter(&self, tier: Tier) -> &LimiterState {
        &self.tiers[tier.index()]
    }

    pub fn current_bps(&self, tier: Tier) -> u64 {
        self.tiers[tier.index()].bps()
    }

    /// Create the direction's state on its first packet: online traffic may
    /// use the whole ceiling, offline tiers start at their maximum.
    #[inline(always)]
    pub fn ensure_init(&self, cfg: &GlobalRateCfg, now: u64) {
        if self.is_initialized() {
            return;
        }
        self.last_adjusted.store(now, Relaxed);
        for tier in Tier::ALL {
            let start = match tier {
                Tier::T0 => cfg.hw_bps(),
                _ => cfg.bounds(tier).1,
            };
            let limiter = self.limiter(tier);
            limiter.reset();
            limiter.set_bps(start);
        }
    }

    /// Redistribute bandwidth between tiers. Runs at most once per
    /// [`ADJUST_INTERVAL_NS`]; returns whether it ran.
    ///
    /// All quantities are whole MB/s; sub-megabyte remainders are dropped.
    #[inline(always)]
    pub fn adjust(&self, cfg: &GlobalRateCfg, ring: &RateRing, now: u64) -> bool {
        let last = self.last_adjusted.load(Relaxed);
        if last != UNSET && now.saturating_sub(last) < ADJUST_INTERVAL_NS {
            return false;
        }
        self.last_adjusted.store(now, Relaxed);

        let ceiling = cfg.hw_bps() / MEGABYTE;

        let mut floor = [0u64; 3];
        let mut upper = [0u64; 3];
        let mut cur = [0u64; 3];
        for tier in Tier::ALL {
            let i = tier.index();
            let (min, max) = cfg.bounds(tier);
            floor[i] = min / MEGABYTE;
            // Online traffic is bounded by the hardware, not its own max
            upper[i] = if tier == Tier::T0 { ceiling } else { max / MEGABYTE };

            let raw = self.current_bps(tier);
            cur[i] = raw / MEGABYTE;
            let clamped = cur[i].min(upper[i]).max(floor[i]);
            if clamped != cur[i] {
                cur[i] = clamped;
                self.write_mb(tier, clamped);
            }
        }

        let avg = ring.average(now) / MEGABYTE;
        if avg > ceiling {
            self.suppress(avg - ceiling, &floor, &cur);
        } else {
            self.recover(ceiling - avg, &upper, &cur);
        }
        true
    }

    /// Take `overflow` MB/s away from the lowest priority tiers first,
    /// never below their configured minimum.
    fn suppress(&self, mut overflow: u64, floor: &[u64; 3], cur: &[u64; 3]) {
        for tier in Tier::SUPPRESS_ORDER {
            if overflow == 0 {
                break;
            }
            let i = tier.index();
            if cur[i] <= floor[i] {
                continue;
            }
            let room = cur[i] - floor[i];
            if overflow >= room {
                overflow -= room;
                self.write_mb(tier, floor[i]);
            } else {
                self.write_mb(tier, cur[i] - overflow);
                overflow = 0;
            }
        }
    }

    /// Hand `headroom` MB/s back, highest priority first.
    fn recover(&self, mut headroom: u64, upper: &[u64; 3], cur: &[u64; 3]) {
        for tier in Tier::RECOVER_ORDER {
            if headroom == 0 {
                break;
            }
            let i = tier.index();
            if upper[i] <= cur[i] {
                continue;
            }
            let room = upper[i] - cur[i];
            if headroom >= room {
                headroom -= room;
                self.write_mb(tier, upper[i]);
            } else {
                self.write_mb(tier, cur[i] + headroom);
                headroom = 0;
            }
        }
    }

    fn write_mb(&self, tier: Tier, mb: u64) {
        self.limiter(tier).set_bps(mb.saturating_mul(MEGABYTE));
    }

    pub fn snapshot(&self) -> TierSnapshot {
        TierSnapshot {
            last_adjusted: self.last_adjusted.load(Relaxed),
            tiers: [
                self.tiers[0].snapshot(),
                self.tiers[1].snapshot(),
                self.tiers[2].snapshot(),
            ],
        }
    }
}

impl Default for TierState {
    fn default() -> Self {
        Self::new()
    }
}

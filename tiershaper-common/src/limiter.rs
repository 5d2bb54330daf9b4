use core::sync::atomic::{AtomicU64, Ordering::Relaxed};

use crate::{Direction, MIN_TOKEN_BUCKET_BPS, NSEC_PER_SEC, T_HORIZON_DROP, UNSET, Verdict};

/// Rate limiter state for one entity or tier in one direction.
///
/// The same state backs both admission primitives: the token bucket uses
/// `tokens` / `last_update_ns`, the pacer uses `t_last`. The control plane
/// writes `bps`; everything else belongs to the packet path.
#[repr(C)]
#[derive(Debug)]
pub struct LimiterState {
    /// Rate limit in bytes per second. 0 means unlimited.
    pub bps: AtomicU64,
    /// Last token refill timestamp in nanoseconds
    pub last_update_ns: AtomicU64,
    /// Current tokens available (capacity is one second of `bps`)
    pub tokens: AtomicU64,
    /// Departure time of the most recently paced packet
    pub t_last: AtomicU64,
}

impl LimiterState {
    pub const fn new(bps: u64) -> Self {
        Self {
            bps: AtomicU64::new(bps),
            last_update_ns: AtomicU64::new(UNSET),
            tokens: AtomicU64::new(0),
            t_last: AtomicU64::new(UNSET),
        }
    }

    pub fn bps(&self) -> u64 {
        self.bps.load(Relaxed)
    }

    pub fn set_bps(&self, bps: u64) {
        self.bps.store(bps, Relaxed);
    }

    /// Forget all bookkeeping; the next packet sees an idle limiter
    pub fn reset(&self) {
        self.last_update_ns.store(UNSET, Relaxed);
        self.tokens.store(0, Relaxed);
        self.t_last.store(UNSET, Relaxed);
    }

    pub fn snapshot(&self) -> LimiterSnapshot {
        LimiterSnapshot {
            bps: self.bps.load(Relaxed),
            last_update_ns: self.last_update_ns.load(Relaxed),
            tokens: self.tokens.load(Relaxed),
            t_last: self.t_last.load(Relaxed),
        }
    }
}

impl Default for LimiterState {
    fn default() -> Self {
        Self::new(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterSnapshot {
    pub bps: u64,
    pub last_update_ns: u64,
    pub tokens: u64,
    pub t_last: u64,
}

/// Admission contract shared by every limiter stage.
///
/// `departure_ns` is the packet's requested departure time; a primitive may
/// move it into the future but never backwards.
pub trait Admission {
    fn admit(&self, state: &LimiterState, size: u64, departure_ns: &mut u64, now: u64) -> Verdict;
}

/// Burst-tolerant limiter. Non-conforming packets are dropped, never queued.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenBucket;

impl TokenBucket {
    /// Tokens earned over `elapsed_ns` at `rate_bps`.
    ///
    /// Works in microseconds so the product stays small, and divides first
    /// once a full second has passed (the bucket is full by then anyway).
    #[inline(always)]
    pub fn refill(rate_bps: u64, elapsed_ns: u64) -> u64 {
        let elapsed_us = elapsed_ns / 1000;
        if elapsed_us < 1_000_000 {
            elapsed_us.saturating_mul(rate_bps) / 1_000_000
        } else {
            (elapsed_us / 1_000_000).saturating_mul(rate_bps)
        }
    }
}

impl Admission for TokenBucket {
    #[inline(always)]
    fn admit(&self, state: &LimiterState, size: u64, _departure_ns: &mut u64, now: u64) -> Verdict {
        let rate = state.bps.load(Relaxed);
        if rate < MIN_TOKEN_BUCKET_BPS {
            return Verdict::Admit;
        }
        let capacity = rate;

        let last = state.last_update_ns.load(Relaxed);
        let tokens = if last == UNSET {
            // Idle bucket starts full
            capacity
        } else {
            // A clock that went backwards earns nothing
            let elapsed_ns = now.saturating_sub(last);
            state
                .tokens
                .load(Relaxed)
                .saturating_add(Self::refill(rate, elapsed_ns))
                .min(capacity)
        };

        if last == UNSET || now > last {
            state.last_update_ns.store(now, Relaxed);
        }

        if tokens >= size {
            state.tokens.store(tokens - size, Relaxed);
            Verdict::Admit
        } else {
            state.tokens.store(tokens, Relaxed);
            Verdict::Drop
        }
    }
}

/// Earliest-departure-time pacer: delays instead of dropping, up to
/// [`T_HORIZON_DROP`].
#[derive(Debug, Clone, Copy, Default)]
pub struct EdtPacer;

impl EdtPacer {
    /// Transmission time of `size` bytes at `rate_bps`, in nanoseconds
    #[inline(always)]
    pub fn delay_ns(size: u64, rate_bps: u64) -> u64 {
        let delay = size as u128 * NSEC_PER_SEC as u128 / rate_bps as u128;
        u64::try_from(delay).unwrap_or(u64::MAX)
    }
}

impl Admission for EdtPacer {
    #[inline(always)]
    fn admit(&self, state: &LimiterState, size: u64, departure_ns: &mut u64, now: u64) -> Verdict {
        let rate = state.bps.load(Relaxed);
        if rate == 0 {
            return Verdict::Admit;
        }

        // A stamp in the past is clamped to now
        let t = (*departure_ns).max(now);

        let last = state.t_last.load(Relaxed);
        if last == UNSET {
            state.t_last.store(t, Relaxed);
            return Verdict::Admit;
        }

        let t_next = last.saturating_add(Self::delay_ns(size, rate));
        if t_next <= t {
            state.t_last.store(t, Relaxed);
            return Verdict::Admit;
        }

        if t_next - now >= T_HORIZON_DROP {
            return Verdict::Drop;
        }

        state.t_last.store(t_next, Relaxed);
        *departure_ns = t_next;
        Verdict::Admit
    }
}

/// Runtime choice between the two primitives, configurable per direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "userspace", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "userspace", serde(rename_all = "snake_case"))]
pub enum Primitive {
    TokenBucket,
    Edt,
}

impl Primitive {
    /// Ingress has no point where a departure stamp is enforced, so it
    /// gets the token bucket; egress gets EDT pacing.
    pub const fn preferred(direction: Direction) -> Self {
        match direction {
            Direction::Ingress => Primitive::TokenBucket,
            Direction::Egress => Primitive::Edt,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Primitive::TokenBucket => "token_bucket",
            Primitive::Edt => "edt",
        }
    }
}

impl Admission for Primitive {
    #[inline(always)]
    fn admit(&self, state: &LimiterState, size: u64, departure_ns: &mut u64, now: u64) -> Verdict {
        match self {
            Primitive::TokenBucket => TokenBucket.admit(state, size, departure_ns, now),
            Primitive::Edt => EdtPacer.admit(state, size, departure_ns, now),
        }
    }
}

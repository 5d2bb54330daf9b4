// Nanosecond clocks for the shaping path

use std::sync::atomic::{AtomicU64, Ordering};

use tiershaper_common::NSEC_PER_SEC;

/// Source of "now" for every shaping decision
pub trait Clock: Send + Sync {
    fn now_ns(&self) -> u64;
}

/// CLOCK_MONOTONIC, the same timebase the kernel stamps packets with
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: ts is a valid, writable timespec
        let ret = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        if ret != 0 {
            return 0;
        }
        (ts.tv_sec as u64)
            .saturating_mul(NSEC_PER_SEC)
            .saturating_add(ts.tv_nsec as u64)
    }
}

/// Manually driven clock for tests and the simulator
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ns: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ns),
        }
    }

    pub fn set(&self, now_ns: u64) {
        self.now.store(now_ns, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }
}

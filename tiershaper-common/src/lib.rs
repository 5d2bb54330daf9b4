#![cfg_attr(not(test), no_std)]

//! Shaping state and algorithms shared by every packet-processing context.
//!
//! Everything in this crate runs on the per-packet path: no heap, no locks,
//! only relaxed atomic loads and stores on plain `#[repr(C)]` state.

pub mod estimator;
pub mod limiter;
pub mod stats;
pub mod tier;

pub use estimator::{NetStat, RateRing, RingSnapshot, SlotSnapshot};
pub use limiter::{Admission, EdtPacer, LimiterSnapshot, LimiterState, Primitive, TokenBucket};
pub use stats::{ShapeStats, StatsSnapshot};
pub use tier::{GlobalRateCfg, RateCfgSnapshot, TierBounds, TierSnapshot, TierState};

use core::fmt;

pub const NSEC_PER_SEC: u64 = 1_000_000_000;
pub const NSEC_PER_MSEC: u64 = 1_000_000;

/// Maximum pacing delay before a packet is dropped instead of stamped
pub const T_HORIZON_DROP: u64 = 2 * NSEC_PER_SEC;

/// Allocator unit: every tier computation is done in whole MB/s
pub const MEGABYTE: u64 = 1_000_000;

/// Token buckets configured below this rate are treated as unlimited
pub const MIN_TOKEN_BUCKET_BPS: u64 = MEGABYTE;

/// Marker for "never updated" timestamps
pub const UNSET: u64 = u64::MAX;

/// Traffic direction, also the index into every per-direction table
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "userspace", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "userspace", serde(rename_all = "snake_case"))]
pub enum Direction {
    Ingress = 0,
    Egress = 1,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Ingress, Direction::Egress];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            Direction::Ingress => "ingress",
            Direction::Egress => "egress",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Priority class sharing the hardware ceiling. T0 is "online" traffic.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "userspace", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "userspace", serde(rename_all = "snake_case"))]
pub enum Tier {
    T0 = 0,
    T1 = 1,
    T2 = 2,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::T0, Tier::T1, Tier::T2];

    /// Order in which tiers give up bandwidth on congestion
    pub const SUPPRESS_ORDER: [Tier; 3] = [Tier::T2, Tier::T1, Tier::T0];

    /// Order in which tiers regain bandwidth when there is headroom
    pub const RECOVER_ORDER: [Tier; 3] = [Tier::T0, Tier::T1, Tier::T2];

    /// Map a cgroup class id / skb priority to a tier. Anything else is
    /// unshaped at the global stage.
    pub const fn from_class_id(class_id: u32) -> Option<Tier> {
        match class_id {
            0 => Some(Tier::T0),
            1 => Some(Tier::T1),
            2 => Some(Tier::T2),
            _ => None,
        }
    }

    pub const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.index())
    }
}

/// Opaque shaping target handle (a cgroup inode in container deployments)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "userspace", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "userspace", serde(transparent))]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Admit,
    Drop,
}

impl Verdict {
    pub const fn is_admit(self) -> bool {
        matches!(self, Verdict::Admit)
    }
}

/// Conditions the pipeline can hit while deciding a verdict. None of them
/// are surfaced as errors; they are counted and the verdict follows the
/// fail-open rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapingFault {
    ConfigurationMissing = 0,
    RateUnconfigured = 1,
    ClockSkew = 2,
    CapacityExceeded = 3,
    MalformedPacket = 4,
}

impl ShapingFault {
    pub const COUNT: usize = 5;

    pub const ALL: [ShapingFault; Self::COUNT] = [
        ShapingFault::ConfigurationMissing,
        ShapingFault::RateUnconfigured,
        ShapingFault::ClockSkew,
        ShapingFault::CapacityExceeded,
        ShapingFault::MalformedPacket,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ShapingFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShapingFault::ConfigurationMissing => "configuration missing",
            ShapingFault::RateUnconfigured => "rate unconfigured",
            ShapingFault::ClockSkew => "clock skew",
            ShapingFault::CapacityExceeded => "capacity exceeded",
            ShapingFault::MalformedPacket => "malformed packet",
        };
        f.write_str(s)
    }
}

/// Per-packet view used by the shaping stages. Only `departure_ns` is ever
/// written, and only to move it into the future.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketDescriptor {
    pub size: u64,
    pub direction: Direction,
    /// Requested departure time; 0 means "as soon as possible"
    pub departure_ns: u64,
    pub tier: Option<Tier>,
    pub entity: Option<EntityId>,
}

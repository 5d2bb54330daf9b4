// All state shared between the control plane and the packet path

use std::net::IpAddr;

use tiershaper_common::{
    Direction, EntityId, GlobalRateCfg, LimiterState, RateRing, ShapeStats, TierState,
};

use crate::resolver::{EntityResolver, PodDirectory, Resolved};
use crate::table::{FlatTable, TableValue};

/// Per-entity limiter plus its counters
#[derive(Debug, Default)]
pub struct EntityLimiter {
    pub limiter: LimiterState,
    pub stats: ShapeStats,
}

impl TableValue for EntityLimiter {
    fn reset(&self) {
        self.limiter.set_bps(0);
        self.limiter.reset();
        self.stats.reset();
    }
}

/// Global state of one direction
#[derive(Debug, Default)]
pub struct DirectionState {
    pub cfg: GlobalRateCfg,
    pub tiers: TierState,
    pub net_stat: RateRing,
    pub stats: ShapeStats,
}

pub struct ShaperMaps {
    pub pods: PodDirectory,
    /// Entity limiters, indexed by direction
    pub entity_rates: [FlatTable<EntityId, EntityLimiter>; 2],
    pub directions: [DirectionState; 2],
}

impl ShaperMaps {
    pub fn with_max_entries(max_entries: usize) -> Self {
        log::debug!("Allocating shaping tables with {} entries each", max_entries);
        Self {
            pods: PodDirectory::with_max_entries(max_entries),
            entity_rates: [
                FlatTable::with_max_entries(max_entries),
                FlatTable::with_max_entries(max_entries),
            ],
            directions: [DirectionState::default(), DirectionState::default()],
        }
    }

    #[inline]
    pub fn direction(&self, direction: Direction) -> &DirectionState {
        &self.directions[direction.index()]
    }

    pub fn entity_table(&self, direction: Direction) -> &FlatTable<EntityId, EntityLimiter> {
        &self.entity_rates[direction.index()]
    }

    #[inline]
    pub fn entity(&self, direction: Direction, entity: EntityId) -> Option<&EntityLimiter> {
        self.entity_rates[direction.index()].get(&entity)
    }
}

impl EntityResolver for ShaperMaps {
    #[inline]
    fn resolve(&self, addr: IpAddr, direction: Direction) -> Option<Resolved> {
        self.pods.resolve(addr, direction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recycled_entity_starts_clean() {
        let maps = ShaperMaps::with_max_entries(2);
        let table = maps.entity_table(Direction::Egress);
        let (e, _) = table.get_or_insert(EntityId(1)).unwrap();
        e.limiter.set_bps(5_000_000);
        e.stats.record_seen(100);
        table.remove(&EntityId(1));

        let (e, created) = table.get_or_insert(EntityId(2)).unwrap();
        assert!(created);
        assert_eq!(e.limiter.bps(), 0);
        assert_eq!(e.stats.snapshot().packets_total, 0);
    }

    #[test]
    fn test_directions_are_independent() {
        let maps = ShaperMaps::with_max_entries(4);
        maps.direction(Direction::Ingress).stats.record_seen(10);
        assert_eq!(maps.direction(Direction::Egress).stats.snapshot().packets_total, 0);
        maps.entity_table(Direction::Ingress)
            .get_or_insert(EntityId(3))
            .unwrap();
        assert!(maps.entity(Direction::Ingress, EntityId(3)).is_some());
        assert!(maps.entity(Direction::Egress, EntityId(3)).is_none());
    }
}

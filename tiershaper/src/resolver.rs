// Entity resolution: which shaping target does a packet belong to?

use std::net::{IpAddr, Ipv6Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use tiershaper_common::{Direction, EntityId, Tier};

use crate::table::{FlatTable, TableKey, TableValue};

/// Result of a successful resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub entity: EntityId,
    /// Tier the entity's traffic belongs to, if its class id maps to one
    pub tier: Option<Tier>,
}

/// Maps a packet's local address to its shaping entity.
///
/// Called on every packet; implementations must not block or allocate.
pub trait EntityResolver: Send + Sync {
    fn resolve(&self, addr: IpAddr, direction: Direction) -> Option<Resolved>;
}

impl<T: EntityResolver + ?Sized> EntityResolver for Arc<T> {
    fn resolve(&self, addr: IpAddr, direction: Direction) -> Option<Resolved> {
        (**self).resolve(addr, direction)
    }
}

/// IP address normalized to 128 bits; IPv4 is stored v4-mapped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddrKey(pub u128);

impl From<IpAddr> for AddrKey {
    fn from(addr: IpAddr) -> Self {
        let v6 = match addr {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        AddrKey(u128::from(v6))
    }
}

impl AddrKey {
    pub fn to_ip(self) -> IpAddr {
        let v6 = Ipv6Addr::from(self.0);
        match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        }
    }
}

impl TableKey for AddrKey {
    fn to_words(self) -> [u64; 2] {
        [(self.0 >> 64) as u64, self.0 as u64]
    }

    fn from_words(words: [u64; 2]) -> Self {
        AddrKey(((words[0] as u128) << 64) | words[1] as u128)
    }
}

/// Directory value: the entity behind an address and its class id
#[derive(Debug, Default)]
pub struct PodEntry {
    pub entity: AtomicU64,
    pub class_id: AtomicU32,
}

impl PodEntry {
    pub fn entity(&self) -> EntityId {
        EntityId(self.entity.load(Ordering::Relaxed))
    }

    pub fn class_id(&self) -> u32 {
        self.class_id.load(Ordering::Relaxed)
    }
}

impl TableValue for PodEntry {
    fn reset(&self) {
        self.entity.store(0, Ordering::Relaxed);
        self.class_id.store(0, Ordering::Relaxed);
    }
}

/// Address → pod table written by the control plane
pub struct PodDirectory {
    table: FlatTable<AddrKey, PodEntry>,
}

impl PodDirectory {
    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            table: FlatTable::with_max_entries(max_entries),
        }
    }

    pub fn table(&self) -> &FlatTable<AddrKey, PodEntry> {
        &self.table
    }

    pub fn lookup(&self, addr: IpAddr) -> Option<&PodEntry> {
        self.table.get(&AddrKey::from(addr))
    }
}

impl EntityResolver for PodDirectory {
    #[inline]
    fn resolve(&self, addr: IpAddr, _direction: Direction) -> Option<Resolved> {
        let entry = self.lookup(addr)?;
        let entity = entry.entity();
        // A half-written entry is treated as absent
        if entity.0 == 0 {
            return None;
        }
        Some(Resolved {
            entity,
            tier: Tier::from_class_id(entry.class_id()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addr_key_v4_mapped() {
        let v4: IpAddr = "192.168.1.10".parse().unwrap();
        let mapped: IpAddr = "::ffff:192.168.1.10".parse().unwrap();
        assert_eq!(AddrKey::from(v4), AddrKey::from(mapped));
        assert_eq!(AddrKey::from(v4).to_ip(), v4);

        let v6: IpAddr = "fd00::10".parse().unwrap();
        assert_eq!(AddrKey::from(v6).to_ip(), v6);
        assert_eq!(AddrKey::from_words(AddrKey::from(v6).to_words()), AddrKey::from(v6));
    }

    #[test]
    fn test_directory_resolves_entity_and_tier() {
        let dir = PodDirectory::with_max_entries(16);
        let addr: IpAddr = "10.0.0.5".parse().unwrap();
        let (entry, _) = dir.table().get_or_insert(AddrKey::from(addr)).unwrap();
        entry.entity.store(77, Ordering::Relaxed);
        entry.class_id.store(2, Ordering::Relaxed);

        let r = dir.resolve(addr, Direction::Egress).unwrap();
        assert_eq!(r.entity, EntityId(77));
        assert_eq!(r.tier, Some(Tier::T2));

        let other: IpAddr = "10.0.0.6".parse().unwrap();
        assert!(dir.resolve(other, Direction::Egress).is_none());
    }

    #[test]
    fn test_unknown_class_has_no_tier() {
        let dir = PodDirectory::with_max_entries(4);
        let addr: IpAddr = "fd00::1".parse().unwrap();
        let (entry, _) = dir.table().get_or_insert(AddrKey::from(addr)).unwrap();
        entry.entity.store(5, Ordering::Relaxed);
        entry.class_id.store(0x10001, Ordering::Relaxed);
        let r = dir.resolve(addr, Direction::Ingress).unwrap();
        assert_eq!(r.tier, None);
    }

    #[test]
    fn test_resolver_through_arc() {
        let dir = Arc::new(PodDirectory::with_max_entries(4));
        let addr: IpAddr = "10.1.1.1".parse().unwrap();
        let (entry, _) = dir.table().get_or_insert(AddrKey::from(addr)).unwrap();
        entry.entity.store(9, Ordering::Relaxed);
        let resolver: &dyn EntityResolver = &dir;
        assert_eq!(resolver.resolve(addr, Direction::Egress).unwrap().entity, EntityId(9));
    }
}

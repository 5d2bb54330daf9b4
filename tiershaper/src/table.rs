// Fixed-capacity key/value table shared between the control plane and the
// packet path.
//
// Open addressing with linear probing over a slice allocated once. Lookups
// take no locks; inserts and removes are expected from a single control
// plane writer at a time and fail instead of growing.

use anyhow::{Result, bail};
use rustc_hash::FxHasher;
use std::hash::{BuildHasher, BuildHasherDefault, Hash};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};

use tiershaper_common::EntityId;

/// Capacity of every shared table unless configured otherwise
pub const DEFAULT_MAX_ENTRIES: usize = 65_535;

const EMPTY: u8 = 0;
const BUSY: u8 = 1;
const LIVE: u8 = 2;
const DEAD: u8 = 3;

/// Keys are stored as two words so readers never see a torn key
pub trait TableKey: Copy + Eq + Hash {
    fn to_words(self) -> [u64; 2];
    fn from_words(words: [u64; 2]) -> Self;
}

impl TableKey for EntityId {
    fn to_words(self) -> [u64; 2] {
        [self.0, 0]
    }

    fn from_words(words: [u64; 2]) -> Self {
        EntityId(words[0])
    }
}

/// Values live in place for the table's lifetime and are recycled
pub trait TableValue: Default + Send + Sync {
    /// Return the value to its freshly-inserted state
    fn reset(&self);
}

struct Slot<V> {
    state: AtomicU8,
    key: [AtomicU64; 2],
    value: V,
}

impl<V: Default> Default for Slot<V> {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            key: [AtomicU64::new(0), AtomicU64::new(0)],
            value: V::default(),
        }
    }
}

pub struct FlatTable<K, V> {
    /// Power of two, at least twice `max_entries`
    slots: Box<[Slot<V>]>,
    max_entries: usize,
    shift: u32,
    /// Longest distance from home any insert has used; lookups stop there
    max_probe: AtomicUsize,
    len: AtomicUsize,
    hasher: BuildHasherDefault<FxHasher>,
    _key: PhantomData<K>,
}

impl<K: TableKey, V: TableValue> FlatTable<K, V> {
    pub fn with_max_entries(max_entries: usize) -> Self {
        let max_entries = max_entries.max(1);
        let n_slots = max_entries.saturating_mul(2).next_power_of_two();
        let slots = (0..n_slots).map(|_| Slot::default()).collect();
        Self {
            slots,
            max_entries,
            shift: u64::BITS - n_slots.trailing_zeros(),
            max_probe: AtomicUsize::new(0),
            len: AtomicUsize::new(0),
            hasher: BuildHasherDefault::default(),
            _key: PhantomData,
        }
    }

    pub fn capacity(&self) -> usize {
        self.max_entries
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn mask(&self) -> usize {
        self.slots.len() - 1
    }

    /// Fibonacci-style: the top bits of the Fx hash pick the home slot
    fn home(&self, key: &K) -> usize {
        (self.hasher.hash_one(key) >> self.shift) as usize
    }

    fn find(&self, key: &K) -> Option<usize> {
        let words = key.to_words();
        let home = self.home(key);
        let limit = self.max_probe.load(Ordering::Acquire);
        for dist in 0..=limit {
            let idx = (home + dist) & self.mask();
            let slot = &self.slots[idx];
            match slot.state.load(Ordering::Acquire) {
                EMPTY => return None,
                LIVE => {
                    if slot.key[0].load(Ordering::Relaxed) == words[0]
                        && slot.key[1].load(Ordering::Relaxed) == words[1]
                    {
                        return Some(idx);
                    }
                }
                _ => {}
            }
        }
        None
    }

    /// Packet-path lookup
    #[inline]
    pub fn get(&self, key: &K) -> Option<&V> {
        self.find(key).map(|idx| &self.slots[idx].value)
    }

    /// Look up `key`, claiming a slot for it if absent. The bool is true when
    /// the entry was created by this call.
    pub fn get_or_insert(&self, key: K) -> Result<(&V, bool)> {
        if let Some(value) = self.get(&key) {
            return Ok((value, false));
        }
        if self.len() >= self.max_entries {
            bail!("table full ({} entries)", self.capacity());
        }

        let words = key.to_words();
        let home = self.home(&key);
        for dist in 0..self.slots.len() {
            let slot = &self.slots[(home + dist) & self.mask()];
            let state = slot.state.load(Ordering::Relaxed);
            if state != EMPTY && state != DEAD {
                continue;
            }
            if slot
                .state
                .compare_exchange(state, BUSY, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            slot.key[0].store(words[0], Ordering::Relaxed);
            slot.key[1].store(words[1], Ordering::Relaxed);
            slot.value.reset();
            // Widen the lookup window before the entry becomes visible
            self.max_probe.fetch_max(dist, Ordering::Release);
            slot.state.store(LIVE, Ordering::Release);
            self.len.fetch_add(1, Ordering::Relaxed);
            return Ok((&slot.value, true));
        }

        bail!("table full ({} entries)", self.capacity())
    }

    /// Remove `key`; returns whether it was present.
    ///
    /// The freed slot becomes a tombstone. Tombstones that end a probe
    /// chain (next slot EMPTY) are turned back into EMPTY, walking
    /// backwards, so misses keep stopping early after churn.
    pub fn remove(&self, key: &K) -> bool {
        let Some(mut idx) = self.find(key) else {
            return false;
        };
        self.slots[idx].state.store(DEAD, Ordering::Release);
        self.len.fetch_sub(1, Ordering::Relaxed);

        let mask = self.mask();
        for _ in 0..self.slots.len() {
            let next = &self.slots[(idx + 1) & mask];
            let here = &self.slots[idx];
            if next.state.load(Ordering::Acquire) != EMPTY
                || here
                    .state
                    .compare_exchange(DEAD, EMPTY, Ordering::Release, Ordering::Relaxed)
                    .is_err()
            {
                break;
            }
            idx = idx.wrapping_sub(1) & mask;
        }
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = (K, &V)> + '_ {
        self.slots.iter().filter_map(|slot| {
            if slot.state.load(Ordering::Acquire) != LIVE {
                return None;
            }
            let key = K::from_words([
                slot.key[0].load(Ordering::Relaxed),
                slot.key[1].load(Ordering::Relaxed),
            ]);
            Some((key, &slot.value))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[derive(Debug, Default)]
    struct Counter(AtomicU64);

    impl TableValue for Counter {
        fn reset(&self) {
            self.0.store(0, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_insert_get_remove() {
        let table: FlatTable<EntityId, Counter> = FlatTable::with_max_entries(16);
        let (v, created) = table.get_or_insert(EntityId(42)).unwrap();
        assert!(created);
        v.0.store(7, Ordering::Relaxed);

        let (v, created) = table.get_or_insert(EntityId(42)).unwrap();
        assert!(!created);
        assert_eq!(v.0.load(Ordering::Relaxed), 7);
        assert_eq!(table.len(), 1);

        assert!(table.remove(&EntityId(42)));
        assert!(!table.remove(&EntityId(42)));
        assert!(table.get(&EntityId(42)).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_full_table_rejects_insert() {
        let table: FlatTable<EntityId, Counter> = FlatTable::with_max_entries(4);
        for id in 1..=4 {
            table.get_or_insert(EntityId(id)).unwrap();
        }
        let err = table.get_or_insert(EntityId(5)).unwrap_err();
        assert!(err.to_string().contains("table full"));

        // Existing keys are still reachable
        for id in 1..=4 {
            assert!(table.get(&EntityId(id)).is_some());
        }
    }

    #[test]
    fn test_collisions_survive_tombstones() {
        let table: FlatTable<EntityId, Counter> = FlatTable::with_max_entries(8);
        for id in 1..=8 {
            table.get_or_insert(EntityId(id)).unwrap();
        }
        // Removing entries in the middle of probe chains must not hide others
        for id in [2, 5, 7] {
            table.remove(&EntityId(id));
        }
        for id in [1, 3, 4, 6, 8] {
            assert!(table.get(&EntityId(id)).is_some(), "lost {id}");
        }

        // Freed slots are reused and their values start clean
        let (v, created) = table.get_or_insert(EntityId(100)).unwrap();
        assert!(created);
        assert_eq!(v.0.load(Ordering::Relaxed), 0);
        assert_eq!(table.len(), 6);
    }

    #[test]
    fn test_churn_keeps_misses_short() {
        let table: FlatTable<EntityId, Counter> = FlatTable::with_max_entries(1024);
        for id in 1..=8 {
            table.get_or_insert(EntityId(id)).unwrap();
        }
        for round in 0..20_000u64 {
            let id = EntityId(1_000 + round);
            table.get_or_insert(id).unwrap();
            assert!(table.remove(&id));
        }
        assert_eq!(table.len(), 8);
        for id in 1..=8 {
            assert!(table.get(&EntityId(id)).is_some());
        }

        let empty = table
            .slots
            .iter()
            .filter(|s| s.state.load(Ordering::Relaxed) == EMPTY)
            .count();
        assert!(empty >= table.slots.len() - 16, "only {empty} empty slots");

        // A miss scans at most max_probe + 1 slots
        let max_probe = table.max_probe.load(Ordering::Relaxed);
        assert!(max_probe < 16, "max_probe = {max_probe}");
        assert!(table.get(&EntityId(999_999)).is_none());
    }

    #[test]
    fn test_remove_clears_trailing_tombstones() {
        let table: FlatTable<EntityId, Counter> = FlatTable::with_max_entries(16);
        let ids: Vec<EntityId> = (1..=16).map(EntityId).collect();
        for id in &ids {
            table.get_or_insert(*id).unwrap();
        }
        for id in &ids {
            assert!(table.remove(id));
        }
        assert!(table.is_empty());
        assert!(
            table
                .slots
                .iter()
                .all(|s| s.state.load(Ordering::Relaxed) == EMPTY)
        );
        assert_eq!(table.capacity(), 16);
        assert_eq!(table.slots.len(), 32);
    }

    #[test]
    fn test_iter_lists_live_entries() {
        let table: FlatTable<EntityId, Counter> = FlatTable::with_max_entries(32);
        for id in 10..20 {
            table.get_or_insert(EntityId(id)).unwrap();
        }
        table.remove(&EntityId(15));
        let keys: HashSet<u64> = table.iter().map(|(k, _)| k.0).collect();
        assert_eq!(keys.len(), 9);
        assert!(!keys.contains(&15));
    }

    #[test]
    fn test_concurrent_readers_during_writes() {
        let table: FlatTable<EntityId, Counter> = FlatTable::with_max_entries(64);
        for id in 1..=32 {
            table.get_or_insert(EntityId(id)).unwrap();
        }
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for round in 0..10_000u64 {
                        let id = round % 32 + 1;
                        if let Some(v) = table.get(&EntityId(id)) {
                            v.0.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
            s.spawn(|| {
                for round in 0..1_000u64 {
                    let id = 33 + round % 16;
                    table.get_or_insert(EntityId(id)).unwrap();
                    table.remove(&EntityId(id));
                }
            });
        });
        // Stable entries were never lost
        for id in 1..=32 {
            assert!(table.get(&EntityId(id)).is_some());
        }
        assert_eq!(table.len(), 32);
    }
}

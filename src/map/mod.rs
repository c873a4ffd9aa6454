//! # Persistent Robin Hood Hash Map
//!
//! `PersistentMap<K, V>` is the workhorse container of the graph database:
//! an open-addressing Robin Hood table whose slot array lives directly in a
//! file-backed memory mapping. A map is identified by directory plus name;
//! that pair determines the backing file, and reopening the same pair in a
//! later process observes the same entries in the same slots.
//!
//! ## Why Robin Hood over a mapping
//!
//! Fixed-size records plus power-of-two capacity means every slot sits at a
//! deterministic byte offset, so the table needs no serialization layer at
//! all: a lookup is a hash, a masked index, and a handful of byte compares
//! against the info array. The info byte packs the probe distance together
//! with the top bits of the hash, so almost every mismatching slot is
//! rejected without touching the record array. When distances outgrow the
//! byte, the encoding gives one hash bit back to distance headroom
//! (`info_inc` halves) before any reallocation happens; only after that
//! does the table double.
//!
//! ## Concurrency contract
//!
//! A map is single-writer: operations from the owning thread are sequenced
//! as written, and the only cross-thread party is the GC registry's
//! reclamation callback, synchronized through the per-map in-use flag.
//! Distinct maps may be used from distinct threads freely, which is what
//! the bottom-up scheduler relies on.
//!
//! ## Keys and values
//!
//! Both must be fixed-size bit-copyable records ([`FixedRecord`]); keys
//! additionally compare by value and hash through [`MapHash`]. Strings do
//! not qualify; intern them through [`StrArena`](crate::StrArena) and key
//! on the returned [`StrId`](crate::StrId).

mod core;
pub mod hash;
mod header;
mod intern;
mod iter;

use std::path::Path;
use std::sync::Arc;

use eyre::Result;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub use self::hash::{hash_bytes, MapHash};
pub use self::header::{
    INITIAL_NUM_ELEMENTS, MAX_LOAD_FACTOR_100,
};
pub use self::intern::{StrArena, StrId};
pub use self::iter::MapIter;

use self::core::MapCore;
use self::header::max_allowed_for;

/// Marker for types that may live inside a map record: plain bytes, no
/// padding, no pointers, no drop glue.
pub trait FixedRecord:
    FromBytes + IntoBytes + Immutable + KnownLayout + Copy + Send + Sync + 'static
{
}

impl<T> FixedRecord for T where
    T: FromBytes + IntoBytes + Immutable + KnownLayout + Copy + Send + Sync + 'static
{
}

/// Key contract: a fixed record that compares by value and hashes stably.
pub trait MapKey: FixedRecord + Eq + MapHash {}

impl<T: FixedRecord + Eq + MapHash> MapKey for T {}

pub struct PersistentMap<K: MapKey, V: FixedRecord> {
    core: Arc<MapCore<K, V>>,
}

impl<K: MapKey, V: FixedRecord> PersistentMap<K, V> {
    /// Opens (or lazily creates) the map backed by `dir/name`. The file is
    /// not materialized until the first write.
    pub fn open(dir: impl AsRef<Path>, name: &str) -> Result<Self> {
        Ok(PersistentMap {
            core: MapCore::new(dir.as_ref(), Some(name))?,
        })
    }

    /// A map with anonymous backing memory: same semantics, no durability.
    pub fn ephemeral() -> Self {
        PersistentMap {
            core: MapCore::new(Path::new("."), None)
                .expect("anonymous map construction cannot fail"),
        }
    }

    /// Path of the backing file, if this map is persistent.
    pub fn backing_path(&self) -> Option<&Path> {
        self.core.file_path()
    }

    /// Inserts or overwrites. Returns the slot index of the stored entry.
    pub fn set(&self, key: K, val: V) -> usize {
        let _g = self.core.op_guard();
        self.core.do_create(key, val)
    }

    /// The value stored under `key`.
    ///
    /// # Panics
    /// If the key is absent. Check [`has`](Self::has) first, or use
    /// [`find`](Self::find) for a non-panicking lookup.
    pub fn get(&self, key: &K) -> V {
        let _g = self.core.op_guard();
        if self.core.reload_ro() {
            // SAFETY: guard held, mapped per reload_ro.
            let view = unsafe { self.core.view() };
            if let Some(idx) = self.core.find_idx(&view, key) {
                return view.value(idx);
            }
        }
        panic!("PersistentMap::get on an absent key");
    }

    pub fn has(&self, key: &K) -> bool {
        let _g = self.core.op_guard();
        if !self.core.reload_ro() {
            return false;
        }
        // SAFETY: guard held, mapped per reload_ro.
        let view = unsafe { self.core.view() };
        self.core.find_idx(&view, key).is_some()
    }

    /// Cursor positioned at `key`'s entry, or at the end when absent. The
    /// cursor ref-locks the map for its lifetime.
    pub fn find(&self, key: &K) -> MapIter<K, V> {
        MapIter::positioned(Arc::clone(&self.core), key)
    }

    /// Removes `key`. Returns 1 if an entry was removed, 0 otherwise.
    pub fn erase(&self, key: &K) -> usize {
        let _g = self.core.op_guard();
        self.core.erase_key(key)
    }

    /// Erases the entry under `it`'s cursor and re-settles the cursor on
    /// the next live entry. Returns true when the erased slot ended empty,
    /// false when the backward shift moved a displaced entry into it (that
    /// entry is now under the cursor).
    ///
    /// # Panics
    /// If `it` belongs to another map or sits at the end.
    pub fn erase_at(&self, it: &mut MapIter<K, V>) -> bool {
        assert!(
            Arc::ptr_eq(&self.core, it.core()),
            "erase_at with an iterator from another map"
        );
        assert!(!it.is_end(), "erase_at at the end of the map");
        debug_assert!(self.core.ref_lock_count() > 0);

        // SAFETY: the iterator's ref-lock holds the in-use flag and pins
        // the mapping.
        let view = unsafe { self.core.view() };
        let emptied = self.core.erase_slot(&view, it.slot());
        if emptied {
            it.resync();
        }
        emptied
    }

    /// Grows the table so `count` entries fit without rehashing.
    pub fn reserve(&self, count: usize) {
        let _g = self.core.op_guard();
        self.core.reload_rw();

        let mut new_size = (self.core.mask() + 1).max(INITIAL_NUM_ELEMENTS as u64);
        while max_allowed_for(new_size) < count as u64 {
            new_size *= 2;
        }
        self.core.rehash(new_size as usize);
    }

    /// Drops every entry and unlinks the backing file.
    ///
    /// # Panics
    /// If any iterator currently ref-locks the map.
    pub fn clear(&self) {
        self.core.clear();
    }

    pub fn len(&self) -> u64 {
        let _g = self.core.op_guard();
        self.core.num_elements()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries the table holds before its next growth.
    pub fn capacity(&self) -> u64 {
        let _g = self.core.op_guard();
        self.core.max_allowed()
    }

    pub fn load_factor(&self) -> f32 {
        let _g = self.core.op_guard();
        let slots = self.core.mask() + 1;
        if slots <= 1 {
            return 0.0;
        }
        self.core.num_elements() as f32 / slots as f32
    }

    /// Iterates every entry in slot order. Ref-locks the map for the
    /// iterator's lifetime; do not insert while one is alive.
    pub fn iter(&self) -> MapIter<K, V> {
        MapIter::begin(Arc::clone(&self.core))
    }

    pub fn keys(&self) -> impl Iterator<Item = K> + '_ {
        self.iter().map(|(k, _)| k)
    }

    pub fn values(&self) -> impl Iterator<Item = V> + '_ {
        self.iter().map(|(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_in(dir: &tempfile::TempDir, name: &str) -> PersistentMap<u64, u64> {
        PersistentMap::open(dir.path(), name).unwrap()
    }

    /// Walks the whole info array checking the Robin Hood invariants:
    /// occupied bytes carry at least one increment, the live count matches
    /// the header, the sentinel survives, and every stored entry is
    /// reachable by probing from its home slot (the probe sequence never
    /// terminates before it).
    fn check_info_invariants(map: &PersistentMap<u64, u64>) {
        let _g = map.core.op_guard();
        if !map.core.reload_ro() {
            return;
        }
        // SAFETY: guard held, mapped.
        let view = unsafe { map.core.view() };
        let hdr = view.header();
        let inc = hdr.info_inc();
        let capacity = hdr.capacity();

        assert_eq!(view.info(capacity), 1, "sentinel must stay 1");

        let mut live = 0u64;
        for i in 0..capacity {
            let b = view.info(i) as u32;
            if b == 0 {
                continue;
            }
            live += 1;
            assert!(b >= inc, "occupied slot {i} below home distance: {b} < {inc}");
            let key = view.key(i);
            assert_eq!(
                map.core.find_idx(&view, &key),
                Some(i),
                "entry at slot {i} unreachable from its home slot"
            );
        }
        assert_eq!(live, hdr.num_elements());
    }

    #[test]
    fn empty_map_answers_without_creating_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let map = open_in(&dir, "probe");

        assert!(!map.has(&7));
        assert_eq!(map.len(), 0);
        assert!(map.is_empty());
        assert!(map.find(&7).is_end());
        assert!(!map.backing_path().unwrap().exists());
    }

    #[test]
    fn set_get_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let map = open_in(&dir, "basic");

        map.set(1, 10);
        map.set(2, 20);
        assert_eq!(map.get(&1), 10);
        assert_eq!(map.get(&2), 20);
        assert_eq!(map.len(), 2);

        let slot_before = map.set(1, 11);
        let slot_after = map.set(1, 12);
        assert_eq!(slot_before, slot_after, "overwrite must reuse the slot");
        assert_eq!(map.get(&1), 12);
        assert_eq!(map.len(), 2);
    }

    #[test]
    #[should_panic(expected = "absent key")]
    fn get_on_absent_key_panics() {
        let map: PersistentMap<u64, u64> = PersistentMap::ephemeral();
        map.set(1, 1);
        let _ = map.get(&2);
    }

    #[test]
    fn growth_keeps_every_entry_reachable() {
        let dir = tempfile::tempdir().unwrap();
        let map = open_in(&dir, "grow");

        // 5000 entries forces growth past the initial 1024 slots.
        for k in 0u64..5000 {
            map.set(k, k * k);
        }
        assert_eq!(map.len(), 5000);
        for k in (0u64..5000).step_by(97) {
            assert_eq!(map.get(&k), k * k);
        }
        check_info_invariants(&map);
    }

    #[test]
    fn erase_restores_cluster_shape() {
        let dir = tempfile::tempdir().unwrap();
        let map = open_in(&dir, "erase");

        for k in 0u64..5000 {
            map.set(k, k);
        }
        for k in (1u64..5000).step_by(2) {
            assert_eq!(map.erase(&k), 1);
        }
        assert_eq!(map.erase(&1), 0);
        assert_eq!(map.len(), 2500);

        for k in 0u64..5000 {
            assert_eq!(map.has(&k), k % 2 == 0, "key {k}");
        }
        check_info_invariants(&map);
    }

    #[test]
    fn iteration_sees_each_entry_once() {
        let dir = tempfile::tempdir().unwrap();
        let map = open_in(&dir, "iter");

        for k in 0u64..300 {
            map.set(k, k + 1000);
        }
        let mut seen = std::collections::HashSet::new();
        for (k, v) in map.iter() {
            assert_eq!(v, k + 1000);
            assert!(seen.insert(k));
        }
        assert_eq!(seen.len(), 300);
    }

    #[test]
    fn cursor_erase_walks_the_whole_table() {
        let map: PersistentMap<u64, u64> = PersistentMap::ephemeral();
        for k in 0u64..500 {
            map.set(k, k);
        }

        // Drop every entry divisible by 3 while scanning.
        let mut it = map.iter();
        while let Some((k, _)) = it.entry() {
            if k % 3 == 0 {
                map.erase_at(&mut it);
            } else {
                it.advance();
            }
        }
        drop(it);

        assert_eq!(map.len(), 500 - 167);
        for k in 0u64..500 {
            assert_eq!(map.has(&k), k % 3 != 0);
        }
    }

    #[test]
    fn find_positions_cursor_on_match() {
        let map: PersistentMap<u64, u64> = PersistentMap::ephemeral();
        map.set(42, 4242);

        let it = map.find(&42);
        assert_eq!(it.entry(), Some((42, 4242)));
        drop(it);

        assert!(map.find(&43).is_end());
    }

    #[test]
    fn reserve_avoids_midway_rehash() {
        let dir = tempfile::tempdir().unwrap();
        let map = open_in(&dir, "reserve");

        map.reserve(10_000);
        let cap = map.capacity();
        assert!(cap >= 10_000);
        for k in 0u64..10_000 {
            map.set(k, k);
        }
        assert_eq!(map.capacity(), cap, "no growth should have happened");
        check_info_invariants(&map);
    }

    #[test]
    fn clear_unlinks_the_backing_file() {
        let dir = tempfile::tempdir().unwrap();
        let map = open_in(&dir, "clear");

        map.set(1, 1);
        let path = map.backing_path().unwrap().to_path_buf();
        assert!(path.exists());

        map.clear();
        assert_eq!(map.len(), 0);
        assert!(!path.exists());
        assert!(!map.has(&1));

        // The map stays usable after a clear.
        map.set(2, 2);
        assert_eq!(map.get(&2), 2);
    }

    #[test]
    #[should_panic(expected = "iterators hold the map")]
    fn clear_under_iterator_panics() {
        let map: PersistentMap<u64, u64> = PersistentMap::ephemeral();
        map.set(1, 1);
        let _it = map.iter();
        map.clear();
    }

    #[test]
    fn ephemeral_map_full_cycle() {
        let map: PersistentMap<u64, u64> = PersistentMap::ephemeral();
        for k in 0u64..2000 {
            map.set(k, !k);
        }
        assert_eq!(map.len(), 2000);
        for k in (0u64..2000).step_by(131) {
            assert_eq!(map.get(&k), !k);
        }
    }

    #[test]
    fn info_reclaim_survives_heavy_clustering() {
        // u32 keys hashed through the multiplicative hash cluster harder
        // than the murmur path; push enough entries through growth that
        // try_increase_info has a chance to fire, then verify integrity.
        let map: PersistentMap<u32, u64> = PersistentMap::ephemeral();
        for k in 0u32..50_000 {
            map.set(k, k as u64 | 0xdead_0000_0000);
        }
        assert_eq!(map.len(), 50_000);
        for k in (0u32..50_000).step_by(389) {
            assert_eq!(map.get(&k), k as u64 | 0xdead_0000_0000);
        }
    }
}

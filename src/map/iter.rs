//! # Ref-Locked Map Iterators
//!
//! An iterator names a slot by index, never by address: the base pointer is
//! re-derived from the map handle on every step, so the iterator survives
//! the fact that a mapping's virtual address is not stable across reloads.
//! What it cannot survive is a rehash, which is why constructing one takes
//! the map's ref-lock: while any iterator is alive the owning thread holds
//! the in-use flag continuously and the GC callback refuses to touch the
//! region. Insertions during iteration remain the caller's bug, exactly as
//! with the standard library's maps.
//!
//! The type is both a cursor and an `Iterator`. The cursor surface
//! (`entry`, `advance`) is for erase-while-scanning loops paired with
//! [`PersistentMap::erase_at`](super::PersistentMap::erase_at); the
//! `Iterator` impl is for plain scans.

use std::sync::Arc;

use super::core::MapCore;
use super::{FixedRecord, MapKey};

pub struct MapIter<K: MapKey, V: FixedRecord> {
    core: Arc<MapCore<K, V>>,
    idx: usize,
    end: usize,
}

impl<K: MapKey, V: FixedRecord> MapIter<K, V> {
    /// Iterator over the whole table, positioned at the first entry.
    pub(crate) fn begin(core: Arc<MapCore<K, V>>) -> Self {
        core.ref_lock();
        let (idx, end) = if core.reload_ro() {
            // SAFETY: ref_lock holds the in-use flag, reload_ro mapped it.
            let view = unsafe { core.view() };
            (view.fast_forward(0), view.capacity())
        } else {
            (0, 0)
        };
        MapIter { core, idx, end }
    }

    /// Iterator positioned at the entry matching `key`, or at the end.
    pub(crate) fn positioned(core: Arc<MapCore<K, V>>, key: &K) -> Self {
        core.ref_lock();
        let (idx, end) = if core.reload_ro() {
            // SAFETY: as in begin().
            let view = unsafe { core.view() };
            let end = view.capacity();
            (core.find_idx(&view, key).unwrap_or(end), end)
        } else {
            (0, 0)
        };
        MapIter { core, idx, end }
    }

    pub fn is_end(&self) -> bool {
        self.idx >= self.end
    }

    /// The entry under the cursor, or `None` at the end.
    pub fn entry(&self) -> Option<(K, V)> {
        if self.is_end() {
            return None;
        }
        // SAFETY: ref_lock pins the mapping for the iterator's lifetime.
        let view = unsafe { self.core.view() };
        Some((view.key(self.idx), view.value(self.idx)))
    }

    pub fn key(&self) -> Option<K> {
        self.entry().map(|(k, _)| k)
    }

    pub fn value(&self) -> Option<V> {
        self.entry().map(|(_, v)| v)
    }

    /// Moves the cursor to the next occupied slot.
    pub fn advance(&mut self) {
        if self.is_end() {
            return;
        }
        // SAFETY: as in entry().
        let view = unsafe { self.core.view() };
        self.idx = view.fast_forward(self.idx + 1);
    }

    pub(crate) fn slot(&self) -> usize {
        self.idx
    }

    pub(crate) fn core(&self) -> &Arc<MapCore<K, V>> {
        &self.core
    }

    /// Re-settles the cursor on the nearest occupied slot at or after the
    /// current one. Used after an erase leaves the current slot empty.
    pub(crate) fn resync(&mut self) {
        if self.is_end() {
            return;
        }
        // SAFETY: as in entry().
        let view = unsafe { self.core.view() };
        self.idx = view.fast_forward(self.idx);
    }
}

impl<K: MapKey, V: FixedRecord> Iterator for MapIter<K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        let entry = self.entry()?;
        self.advance();
        Some(entry)
    }
}

impl<K: MapKey, V: FixedRecord> Drop for MapIter<K, V> {
    fn drop(&mut self) {
        self.core.ref_unlock();
    }
}

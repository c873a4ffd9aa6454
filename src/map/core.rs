//! # Backing Region State Machine and Probe Engine
//!
//! `MapCore` is the untidy middle of the persistent map: it owns the
//! relationship with the [`GcRegistry`](crate::storage::GcRegistry), keeps
//! the table usable across unmap/remap cycles, and implements the Robin
//! Hood probe arithmetic directly against the mapped bytes.
//!
//! ## Region states
//!
//! ```text
//! unmapped ──first access──► mapped ──iterator open──► mapped + ref-locked
//!    ▲                         │ ▲                          │
//!    │                         │ └──────last iterator closed┘
//!    └──────gc callback────────┘
//! ```
//!
//! A rehash detaches from the old region (phase one), populates a fresh
//! double-capacity region through `insert_move`, then hands the old region
//! to `GcRegistry::release` (phase two). The GC callback checks the base it
//! is offered against the core's current base, so the old region can never
//! be mistaken for the live one.
//!
//! ## Locking
//!
//! One atomic in-use flag per map, taken by every public operation with a
//! test-and-set spin. The flag synchronizes exactly two parties: the owning
//! thread and the registry's reclamation callback, which try-locks and
//! walks away on contention. Iterators pin the flag through the ref-lock
//! counter so the mapping cannot move under a live slot index.
//!
//! ## Safety
//!
//! All raw pointer access happens through [`TableView`], which is only
//! constructed while the in-use flag is held and the region is mapped. The
//! view derives every offset from the header at the base of the mapping, so
//! a remap invalidates nothing but the base pointer itself, which is
//! re-read from the core state on the next operation.

use std::cell::UnsafeCell;
use std::fs::File;
use std::marker::PhantomData;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use eyre::{eyre, Result, WrapErr};

use super::hash::scramble;
use super::header::{
    backing_size, max_allowed_for, records_offset, MapHeader, HEADER_SIZE, INFO_OFFSET,
    INITIAL_INFO_HASH_SHIFT, INITIAL_INFO_INC, INITIAL_NUM_ELEMENTS,
};
use super::{FixedRecord, MapKey};
use crate::storage::{self, registry, Reclaim};

/// Mutable core state, only touched while the in-use flag is held.
pub(crate) struct CoreState {
    base: Option<NonNull<u8>>,
    /// Memoized mapping size, preserved across an unmap so a reload does
    /// not have to re-read the file geometry.
    mapped_size: usize,
    file: Option<File>,
    /// Header fields that survive an unmap, so `len` and friends answer
    /// without faulting the region back in.
    local_mask: u64,
    local_num_elements: u64,
    local_max_allowed: u64,
}

pub(crate) struct MapCore<K, V> {
    file_path: Option<PathBuf>,
    state: UnsafeCell<CoreState>,
    in_use: AtomicBool,
    ref_locked: AtomicU32,
    /// Self-reference handed to the registry as the reclamation owner.
    weak: Weak<MapCore<K, V>>,
    /// Probe collisions observed by `insert_move`; feeds the bad-hash
    /// warning the same way the conflict counter in a debug build would.
    conflicts: AtomicU64,
    inserts: AtomicU64,
    _marker: PhantomData<(K, V)>,
}

// SAFETY: CoreState (behind the UnsafeCell) is only accessed while the
// in-use flag is held, which serializes the owning thread against the
// registry's reclamation callback. K and V are plain bit-copyable records
// (Send + Sync via FixedRecord).
unsafe impl<K: MapKey, V: FixedRecord> Send for MapCore<K, V> {}
unsafe impl<K: MapKey, V: FixedRecord> Sync for MapCore<K, V> {}

/// Releases the in-use flag on drop unless the operation ran under an
/// iterator's ref-lock, which already holds it.
pub(crate) struct OpGuard<'a, K: MapKey, V: FixedRecord> {
    core: &'a MapCore<K, V>,
    owns: bool,
}

impl<K: MapKey, V: FixedRecord> Drop for OpGuard<'_, K, V> {
    fn drop(&mut self) {
        if self.owns {
            self.core.unlock();
        }
    }
}

impl<K: MapKey, V: FixedRecord> MapCore<K, V> {
    pub(crate) fn new(dir: &Path, name: Option<&str>) -> Result<Arc<Self>> {
        let file_path = match name {
            Some(name) => {
                std::fs::create_dir_all(dir).wrap_err_with(|| {
                    format!("failed to create map directory '{}'", dir.display())
                })?;
                Some(dir.join(name))
            }
            None => None,
        };

        Ok(Arc::new_cyclic(|weak| MapCore {
            file_path,
            state: UnsafeCell::new(CoreState {
                base: None,
                mapped_size: 0,
                file: None,
                local_mask: 0,
                local_num_elements: 0,
                local_max_allowed: 0,
            }),
            in_use: AtomicBool::new(false),
            ref_locked: AtomicU32::new(0),
            weak: weak.clone(),
            conflicts: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
            _marker: PhantomData,
        }))
    }

    pub(crate) fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    // ---- locking ---------------------------------------------------------

    fn lock(&self) {
        while self.in_use.swap(true, Ordering::Acquire) {
            std::hint::spin_loop();
        }
    }

    fn unlock(&self) {
        self.in_use.store(false, Ordering::Release);
    }

    fn try_lock(&self) -> bool {
        !self.in_use.swap(true, Ordering::Acquire)
    }

    /// Takes the in-use flag for one public operation. A thread that holds
    /// iterators (ref-lock non-zero) already owns the flag and the guard
    /// becomes a no-op; nesting is how iterator-driven erases compose.
    pub(crate) fn op_guard(&self) -> OpGuard<'_, K, V> {
        let owns = self.ref_locked.load(Ordering::Relaxed) == 0;
        if owns {
            self.lock();
        }
        OpGuard { core: self, owns }
    }

    pub(crate) fn ref_lock(&self) {
        if self.ref_locked.load(Ordering::Relaxed) == 0 {
            self.lock();
        }
        self.ref_locked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn ref_unlock(&self) {
        let prev = self.ref_locked.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "unbalanced ref_unlock");
        if prev == 1 {
            self.unlock();
        }
    }

    pub(crate) fn ref_lock_count(&self) -> u32 {
        self.ref_locked.load(Ordering::Relaxed)
    }

    // ---- state access ----------------------------------------------------

    /// # Safety
    /// Caller must hold the in-use flag.
    #[allow(clippy::mut_from_ref)]
    unsafe fn state(&self) -> &mut CoreState {
        &mut *self.state.get()
    }

    /// # Safety
    /// Caller must hold the in-use flag and the region must be mapped.
    pub(crate) unsafe fn view(&self) -> TableView<K, V> {
        let st = self.state();
        TableView::from_header(st.base.expect("view of unmapped region"))
    }

    /// Ensures the region is mapped, creating the backing file if needed.
    /// Mapping failures at this point are fatal: the caller is mid-write
    /// and the on-disk invariants cannot be reconciled.
    pub(crate) fn reload_rw(&self) {
        // SAFETY: op_guard held by caller.
        let st = unsafe { self.state() };
        if st.base.is_some() {
            return;
        }
        if let Err(err) = self.setup_mmap(st, 0) {
            storage::fatal(err);
        }
    }

    /// Maps the region if there is anything on disk to map. Returns false
    /// when the map has never been materialized (no file, nothing mapped),
    /// in which case read operations answer from the empty state without
    /// creating a backing file.
    pub(crate) fn reload_ro(&self) -> bool {
        // SAFETY: op_guard held by caller.
        let st = unsafe { self.state() };
        if st.base.is_some() {
            return true;
        }
        match &self.file_path {
            // Anonymous regions are only unmapped when empty or torn down.
            None => false,
            Some(path) => {
                if st.mapped_size == 0 && !path.exists() {
                    return false;
                }
                if let Err(err) = self.setup_mmap(st, 0) {
                    storage::fatal(err);
                }
                true
            }
        }
    }

    fn setup_mmap(&self, st: &mut CoreState, forced_entries: usize) -> Result<()> {
        debug_assert!(st.base.is_none());
        let record_size = TableView::<K, V>::RECORD_SIZE;

        let (n_entries, size) = match &self.file_path {
            None => {
                let n = if forced_entries != 0 {
                    forced_entries
                } else {
                    INITIAL_NUM_ELEMENTS
                };
                (n, backing_size(n, record_size))
            }
            Some(path) => {
                if st.file.is_none() {
                    st.file = Some(registry().open(path)?);
                }
                if forced_entries != 0 {
                    (forced_entries, backing_size(forced_entries, record_size))
                } else if st.mapped_size == 0 {
                    // First reload: the stored mask, if any, fixes capacity.
                    let file = st.file.as_ref().unwrap();
                    let mut word = [0u8; 8];
                    let got = file.read_at(&mut word, 0).unwrap_or(0);
                    let mask = if got == 8 {
                        u64::from_le_bytes(word)
                    } else {
                        0
                    };
                    let n = if mask == 0 {
                        INITIAL_NUM_ELEMENTS
                    } else {
                        (mask + 1) as usize
                    };
                    (n, backing_size(n, record_size))
                } else {
                    // Remap after a reclaim: geometry comes from the header.
                    (INITIAL_NUM_ELEMENTS, st.mapped_size)
                }
            }
        };

        let owner: Weak<dyn Reclaim> = self.weak.clone();
        let (base, size) = registry().mmap(
            self.file_path.as_deref(),
            st.file.as_ref(),
            size,
            owner,
        )?;
        st.base = Some(base);
        st.mapped_size = size;

        // SAFETY: the mapping is at least HEADER_SIZE bytes and exclusively
        // ours while the in-use flag is held.
        let existing = unsafe { (base.as_ptr() as *const MapHeader).read() };
        if existing.num_elements() != 0 {
            debug_assert!(existing.max_allowed() <= existing.mask() + 1);
            debug_assert!(backing_size(existing.capacity(), record_size) <= size);
        } else {
            // Fresh file (or one erased down to empty): seed the header and
            // the iterator sentinel. Info bytes are already zero.
            let view = TableView::<K, V>::with_capacity(base, n_entries);
            view.header_update(|h| {
                h.set_mask(n_entries as u64 - 1);
                h.set_num_elements(0);
                h.set_max_allowed(max_allowed_for(n_entries as u64));
                h.set_info_inc(INITIAL_INFO_INC);
                h.set_info_hash_shift(INITIAL_INFO_HASH_SHIFT as u32);
            });
            view.set_info(n_entries, 1);
        }
        Ok(())
    }

    // ---- reclamation -----------------------------------------------------

    /// Owner-driven teardown used by `clear` and drop. Must not be called
    /// while this thread holds the in-use flag.
    pub(crate) fn detach_region(&self) {
        let base = {
            self.lock();
            // SAFETY: in_use held.
            let base = unsafe { self.state() }.base;
            self.unlock();
            base
        };
        if let Some(base) = base {
            registry().recycle(base);
        }
    }

    pub(crate) fn clear(&self) {
        assert!(
            self.ref_lock_count() == 0,
            "clear called while iterators hold the map"
        );
        self.detach_region();

        self.lock();
        // SAFETY: in_use held.
        let st = unsafe { self.state() };
        debug_assert!(st.base.is_none());
        if let Some(path) = &self.file_path {
            // Already gone when the reclaim callback unlinked an empty map.
            let _ = std::fs::remove_file(path);
        }
        st.file = None;
        st.mapped_size = 0;
        st.local_mask = 0;
        st.local_num_elements = 0;
        st.local_max_allowed = 0;
        self.unlock();
    }

    // ---- header reads that tolerate the unmapped state -------------------

    pub(crate) fn num_elements(&self) -> u64 {
        // SAFETY: op_guard held by caller.
        let st = unsafe { self.state() };
        match st.base {
            Some(base) => {
                // SAFETY: mapped and in use.
                unsafe { (base.as_ptr() as *const MapHeader).read() }.num_elements()
            }
            None => st.local_num_elements,
        }
    }

    pub(crate) fn max_allowed(&self) -> u64 {
        // SAFETY: op_guard held by caller.
        let st = unsafe { self.state() };
        match st.base {
            Some(base) => {
                // SAFETY: mapped and in use.
                unsafe { (base.as_ptr() as *const MapHeader).read() }.max_allowed()
            }
            None => {
                if st.local_mask != 0 {
                    st.local_max_allowed
                } else {
                    max_allowed_for(INITIAL_NUM_ELEMENTS as u64)
                }
            }
        }
    }

    pub(crate) fn mask(&self) -> u64 {
        // SAFETY: op_guard held by caller.
        let st = unsafe { self.state() };
        match st.base {
            Some(base) => {
                // SAFETY: mapped and in use.
                unsafe { (base.as_ptr() as *const MapHeader).read() }.mask()
            }
            None => st.local_mask,
        }
    }

    // ---- probe arithmetic ------------------------------------------------

    fn key_to_idx(view: &TableView<K, V>, key: &K) -> (usize, u32) {
        let h = scramble(key.map_hash());
        let hdr = view.header();
        let info = hdr.info_inc() + (h >> hdr.info_hash_shift()) as u32;
        let idx = (h & hdr.mask()) as usize;
        (idx, info)
    }

    pub(crate) fn find_idx(&self, view: &TableView<K, V>, key: &K) -> Option<usize> {
        let mask = view.header().mask() as usize;
        let inc = view.header().info_inc();
        let (mut idx, mut info) = Self::key_to_idx(view, key);

        loop {
            let stored = view.info(idx) as u32;
            if info == stored && *key == view.key(idx) {
                return Some(idx);
            }
            if info > stored {
                return None;
            }
            idx = (idx + 1) & mask;
            info = info.saturating_add(inc);
        }
    }

    /// Insert-or-overwrite. Returns the slot index of the stored entry.
    pub(crate) fn do_create(&self, key: K, val: V) -> usize {
        self.reload_rw();
        loop {
            // SAFETY: op_guard held by caller, mapped by reload_rw/rehash.
            let view = unsafe { self.view() };
            let hdr = view.header();
            let mask = hdr.mask() as usize;
            let inc = hdr.info_inc();

            let (mut idx, mut info) = Self::key_to_idx(&view, &key);

            // Robin Hood: skip past entries that are poorer than us.
            while info < view.info(idx) as u32 {
                idx = (idx + 1) & mask;
                info = info.saturating_add(inc);
            }

            // Equal-distance entries may hold the key already.
            let mut found = false;
            while info == view.info(idx) as u32 {
                if key == view.key(idx) {
                    found = true;
                    break;
                }
                idx = (idx + 1) & mask;
                info = info.saturating_add(inc);
            }

            if found {
                view.write_value(idx, &val);
                return idx;
            }

            if hdr.num_elements() >= hdr.max_allowed()
                || info.saturating_add(inc) > 0xFF
            {
                self.increase_size();
                continue;
            }

            let insertion_idx = idx;
            let insertion_info = info as u8;

            // Claim the first empty slot, shifting the displaced chain up.
            while view.info(idx) != 0 {
                idx = (idx + 1) & mask;
            }
            if idx != insertion_idx {
                Self::shift_up(&view, idx, insertion_idx);
            }

            view.write_record(insertion_idx, &key, &val);
            view.set_info(insertion_idx, insertion_info);
            view.header_update(|h| h.set_num_elements(h.num_elements() + 1));
            return insertion_idx;
        }
    }

    /// Fast-path insertion for rehash: the key is guaranteed absent, so the
    /// equality scan is skipped entirely.
    fn insert_move(&self, view: &TableView<K, V>, key: K, val: V) -> usize {
        if view.header().max_allowed() == 0 {
            let ok = self.try_increase_info(view);
            debug_assert!(ok, "insert_move with no distance headroom left");
        }

        let hdr = view.header();
        let mask = hdr.mask() as usize;
        let inc = hdr.info_inc();
        let (mut idx, mut info) = Self::key_to_idx(view, &key);

        while info <= view.info(idx) as u32 {
            idx = (idx + 1) & mask;
            info = info.saturating_add(inc);
        }

        let insertion_idx = idx;
        if info.saturating_add(inc) > 0xFF {
            view.header_update(|h| h.set_max_allowed(0));
        }
        debug_assert!(info <= 0xFF);
        let insertion_info = info as u8;

        let mut conflicts = 0u64;
        while view.info(idx) != 0 {
            idx = (idx + 1) & mask;
            conflicts += 1;
        }
        if conflicts != 0 {
            self.conflicts.fetch_add(conflicts, Ordering::Relaxed);
        }

        if idx != insertion_idx {
            Self::shift_up(view, idx, insertion_idx);
        }
        view.write_record(insertion_idx, &key, &val);
        view.set_info(insertion_idx, insertion_info);
        view.header_update(|h| h.set_num_elements(h.num_elements() + 1));

        let inserts = self.inserts.fetch_add(1, Ordering::Relaxed) + 1;
        if inserts & 0xFFFF == 0 {
            let n = view.header().num_elements();
            let c = self.conflicts.load(Ordering::Relaxed);
            if n > 100 && c > n / 20 {
                tracing::warn!(
                    conflicts = c,
                    entries = n,
                    file = ?self.file_path,
                    "probe conflict factor suggests a poor key hash"
                );
            }
        }
        insertion_idx
    }

    /// Shifts the displaced chain `[insertion_idx, idx)` up by one slot,
    /// charging each moved entry one more probe step.
    fn shift_up(view: &TableView<K, V>, mut idx: usize, insertion_idx: usize) {
        let mask = view.header().mask() as usize;
        let inc = view.header().info_inc();

        while idx != insertion_idx {
            let prev = (idx + mask) & mask;
            view.copy_record(prev, idx);
            let moved = (view.info(prev) as u32 + inc) as u8;
            view.set_info(idx, moved);
            if moved as u32 + inc > 0xFF {
                view.header_update(|h| h.set_max_allowed(0));
            }
            idx = prev;
        }
    }

    /// Backward-shift deletion starting at a slot whose entry is dead.
    /// Wrap-aware: deletion follows the same index arithmetic as probing.
    fn shift_down(view: &TableView<K, V>, mut idx: usize) {
        let mask = view.header().mask() as usize;
        let inc = view.header().info_inc();

        loop {
            let next = (idx + 1) & mask;
            let next_info = view.info(next) as u32;
            if next_info < 2 * inc {
                break;
            }
            view.set_info(idx, (next_info - inc) as u8);
            view.copy_record(next, idx);
            idx = next;
        }
        view.set_info(idx, 0);
    }

    pub(crate) fn erase_key(&self, key: &K) -> usize {
        if !self.reload_ro() {
            return 0;
        }
        // SAFETY: op_guard held by caller, mapped per reload_ro.
        let view = unsafe { self.view() };
        let mask = view.header().mask() as usize;
        let inc = view.header().info_inc();
        let (mut idx, mut info) = Self::key_to_idx(&view, key);

        loop {
            let stored = view.info(idx) as u32;
            if info == stored && *key == view.key(idx) {
                Self::shift_down(&view, idx);
                view.header_update(|h| h.set_num_elements(h.num_elements() - 1));
                return 1;
            }
            if info > stored {
                return 0;
            }
            idx = (idx + 1) & mask;
            info = info.saturating_add(inc);
        }
    }

    /// Erases the entry at a known-occupied slot. Returns true when the
    /// slot ends empty, false when a displaced entry was shifted into it.
    pub(crate) fn erase_slot(&self, view: &TableView<K, V>, idx: usize) -> bool {
        debug_assert!(view.info(idx) != 0, "erase of an empty slot");
        Self::shift_down(view, idx);
        view.header_update(|h| h.set_num_elements(h.num_elements() - 1));
        view.info(idx) == 0
    }

    // ---- growth ----------------------------------------------------------

    fn try_increase_info(&self, view: &TableView<K, V>) -> bool {
        let hdr = view.header();
        let inc = hdr.info_inc();
        if inc <= 2 {
            // One distance bit must survive the halving.
            return false;
        }

        view.header_update(|h| {
            h.set_info_inc(inc >> 1);
            h.set_info_hash_shift(h.info_hash_shift() + 1);
        });

        // Halve every stored distance. Word-at-a-time: shift right one and
        // drop the bit that crossed into the neighboring byte lane. The
        // sentinel sits past this range and keeps its value.
        let capacity = hdr.capacity();
        let mut i = 0;
        while i < capacity {
            let w = view.info_word(i);
            view.set_info_word(i, (w >> 1) & 0x7f7f_7f7f_7f7f_7f7f);
            i += 8;
        }

        view.header_update(|h| h.set_max_allowed(max_allowed_for(h.capacity() as u64)));
        true
    }

    fn increase_size(&self) {
        // SAFETY: op_guard held by caller, mapped.
        let view = unsafe { self.view() };
        let hdr = view.header();
        let capacity = hdr.capacity() as u64;

        if hdr.num_elements() < max_allowed_for(capacity) && self.try_increase_info(&view) {
            return;
        }

        let Some(doubled) = capacity.checked_mul(2).filter(|c| *c <= 1 << 63) else {
            storage::fatal(eyre!("map capacity exhausted at {capacity} slots"));
        };
        self.rehash(doubled as usize);
    }

    /// Grows the table to `num_buckets` (a power of two) by building a
    /// fresh region and reinserting every live entry, then releasing the
    /// old region. See the module docs for the two-phase hand-off.
    pub(crate) fn rehash(&self, num_buckets: usize) {
        debug_assert!(num_buckets.is_power_of_two());
        self.reload_rw();

        // SAFETY: op_guard held by caller, mapped per reload_rw.
        let st = unsafe { self.state() };
        let old_base = st.base.expect("rehash of unmapped region");
        let old_view = TableView::<K, V>::from_header(old_base);
        let old_capacity = old_view.header().capacity();
        if old_capacity >= num_buckets {
            return;
        }

        tracing::debug!(
            from = old_capacity,
            to = num_buckets,
            file = ?self.file_path,
            "rehash"
        );

        // The new region takes over the file name, so the old bytes lose
        // theirs first. The old pages stay mapped until the hand-off below.
        if st.file.is_some() {
            if let Err(err) = registry().delete_file(old_base) {
                storage::fatal(err);
            }
            st.file = None;
        }

        // Phase one: detach so the reclaim callback cannot confuse the old
        // region for the live one.
        st.base = None;
        st.mapped_size = 0;
        st.local_mask = 0;
        st.local_num_elements = 0;
        st.local_max_allowed = 0;
        if let Err(err) = self.setup_mmap(st, num_buckets) {
            storage::fatal(err);
        }

        let new_view = unsafe { self.view() };
        debug_assert_eq!(new_view.header().num_elements(), 0);
        debug_assert_eq!(new_view.header().capacity(), num_buckets);

        for i in 0..old_capacity {
            if old_view.info(i) != 0 {
                self.insert_move(&new_view, old_view.key(i), old_view.value(i));
            }
        }

        // Phase two: the old region has no owner references left.
        registry().release(old_base);
    }
}

impl<K, V> Drop for MapCore<K, V> {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        if let Some(base) = st.base.take() {
            // The weak self-reference is already dead here, so the registry
            // skips the callback and simply unmaps.
            registry().recycle(base);
        }
    }
}

impl<K: MapKey, V: FixedRecord> Reclaim for MapCore<K, V> {
    fn reclaim(&self, base: NonNull<u8>, force: bool) -> bool {
        if !self.try_lock() {
            return false;
        }
        debug_assert_eq!(self.ref_lock_count(), 0);

        // SAFETY: in_use just acquired.
        let st = unsafe { self.state() };
        if st.base != Some(base) {
            self.unlock();
            return false;
        }

        // SAFETY: mapped, in use.
        let hdr = unsafe { (base.as_ptr() as *const MapHeader).read() };

        // A sweep must not discard anonymous data: there is no file to
        // reload it from.
        if !force && self.file_path.is_none() && hdr.num_elements() != 0 {
            self.unlock();
            return false;
        }

        match &self.file_path {
            Some(path) => {
                if hdr.num_elements() == 0 {
                    let _ = std::fs::remove_file(path);
                    st.mapped_size = 0;
                }
            }
            None => st.mapped_size = 0,
        }

        st.local_mask = hdr.mask();
        st.local_num_elements = hdr.num_elements();
        st.local_max_allowed = hdr.max_allowed();
        st.base = None;
        st.file = None;

        self.unlock();
        true
    }
}

/// Typed window over a mapped table. Derives every offset from the header
/// at the base of the mapping; holds no state of its own beyond the base
/// pointer and the geometry read at construction.
pub(crate) struct TableView<K, V> {
    base: NonNull<u8>,
    records_off: usize,
    _marker: PhantomData<(K, V)>,
}

impl<K: MapKey, V: FixedRecord> TableView<K, V> {
    pub(crate) const RECORD_SIZE: usize =
        std::mem::size_of::<K>() + std::mem::size_of::<V>();

    fn from_header(base: NonNull<u8>) -> Self {
        // SAFETY: caller (MapCore) guarantees base points at a live mapping
        // with an initialized header.
        let capacity = unsafe { (base.as_ptr() as *const MapHeader).read() }.capacity();
        Self::with_capacity(base, capacity)
    }

    fn with_capacity(base: NonNull<u8>, capacity: usize) -> Self {
        TableView {
            base,
            records_off: records_offset(capacity),
            _marker: PhantomData,
        }
    }

    pub(crate) fn header(&self) -> MapHeader {
        // SAFETY: header occupies the first HEADER_SIZE bytes of the
        // mapping and the mapping is page-aligned.
        unsafe { (self.base.as_ptr() as *const MapHeader).read() }
    }

    pub(crate) fn header_update(&self, f: impl FnOnce(&mut MapHeader)) {
        // SAFETY: as in header(); exclusive access per the in-use flag.
        unsafe {
            let p = self.base.as_ptr() as *mut MapHeader;
            let mut h = p.read();
            f(&mut h);
            p.write(h);
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.header().capacity()
    }

    #[inline]
    pub(crate) fn info(&self, idx: usize) -> u8 {
        // SAFETY: idx <= capacity (sentinel included) per caller; the info
        // array plus slack is always inside the mapping.
        unsafe { *self.base.as_ptr().add(INFO_OFFSET + idx) }
    }

    #[inline]
    pub(crate) fn set_info(&self, idx: usize, val: u8) {
        // SAFETY: as in info().
        unsafe { *self.base.as_ptr().add(INFO_OFFSET + idx) = val }
    }

    /// Eight info bytes starting at `idx`, as a little-endian word. The
    /// info array carries 8 slack bytes so this stays in bounds at the
    /// sentinel.
    #[inline]
    pub(crate) fn info_word(&self, idx: usize) -> u64 {
        // SAFETY: idx <= capacity per caller; slack bytes cover the tail.
        let raw = unsafe {
            (self.base.as_ptr().add(INFO_OFFSET + idx) as *const u64).read_unaligned()
        };
        u64::from_le(raw)
    }

    #[inline]
    fn set_info_word(&self, idx: usize, val: u64) {
        // SAFETY: as in info_word().
        unsafe {
            (self.base.as_ptr().add(INFO_OFFSET + idx) as *mut u64)
                .write_unaligned(val.to_le())
        }
    }

    /// First occupied slot at or after `idx`; the sentinel stops the scan
    /// at `capacity`. Word-at-a-time so iteration over sparse tables is
    /// memory-bandwidth bound, not branch bound.
    pub(crate) fn fast_forward(&self, mut idx: usize) -> usize {
        loop {
            let word = self.info_word(idx);
            let step = (word.trailing_zeros() / 8) as usize;
            idx += step;
            if step < 8 {
                return idx;
            }
        }
    }

    #[inline]
    fn record_ptr(&self, idx: usize) -> *mut u8 {
        // SAFETY: idx < capacity per caller; the record array is the tail
        // of the mapping.
        unsafe { self.base.as_ptr().add(self.records_off + idx * Self::RECORD_SIZE) }
    }

    #[inline]
    pub(crate) fn key(&self, idx: usize) -> K {
        read_record(self.record_ptr(idx))
    }

    #[inline]
    pub(crate) fn value(&self, idx: usize) -> V {
        read_record(unsafe { self.record_ptr(idx).add(std::mem::size_of::<K>()) })
    }

    pub(crate) fn write_record(&self, idx: usize, key: &K, val: &V) {
        write_rec(self.record_ptr(idx), key);
        // SAFETY: value bytes follow the key bytes inside the same record.
        write_rec(unsafe { self.record_ptr(idx).add(std::mem::size_of::<K>()) }, val);
    }

    pub(crate) fn write_value(&self, idx: usize, val: &V) {
        // SAFETY: as in write_record().
        write_rec(unsafe { self.record_ptr(idx).add(std::mem::size_of::<K>()) }, val);
    }

    fn copy_record(&self, src: usize, dst: usize) {
        // SAFETY: both slots are inside the record array; copy is exactly
        // one record and the slots are distinct.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.record_ptr(src),
                self.record_ptr(dst),
                Self::RECORD_SIZE,
            );
        }
    }
}

#[inline]
fn read_record<T: FixedRecord>(ptr: *const u8) -> T {
    // SAFETY: caller guarantees ptr..ptr+size_of::<T>() lies inside the
    // mapped record array.
    let bytes = unsafe { std::slice::from_raw_parts(ptr, std::mem::size_of::<T>()) };
    match T::read_from_bytes(bytes) {
        Ok(v) => v,
        Err(_) => unreachable!("record slice has exact size"),
    }
}

#[inline]
fn write_rec<T: FixedRecord>(ptr: *mut u8, val: &T) {
    // SAFETY: as in read_record; FixedRecord types have no padding bytes.
    let bytes = unsafe { std::slice::from_raw_parts_mut(ptr, std::mem::size_of::<T>()) };
    bytes.copy_from_slice(zerocopy::IntoBytes::as_bytes(val));
}

// Keep HEADER_SIZE referenced from this module so layout changes break
// loudly here as well as in header.rs.
const _: () = assert!(HEADER_SIZE == 40);

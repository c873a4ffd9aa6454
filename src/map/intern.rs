//! # Persistent String Interning
//!
//! Map records are fixed-size, so arbitrary strings never live in a table
//! slot. The arena stores each distinct string once in an append-only
//! file-backed byte region and hands out a compact [`StrId`] that is itself
//! a valid map key or value: handle equality is string equality.
//!
//! ## Layout
//!
//! ```text
//! blob file:   [0x00 u64 used][0x08 u64 reserved][cells ...]
//! cell:        [u32 next][u32 len][len bytes][pad to 8]
//! index map:   content hash (u64) -> StrId of the chain head
//! ```
//!
//! Hash collisions chain through the cells' `next` links; interning walks
//! the chain comparing bytes, so two distinct strings never share an id.
//! The arena never shrinks and ids stay stable for the life of the files,
//! which is what lets node records carry names across process restarts.

use std::cell::UnsafeCell;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use eyre::Result;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::hash::{hash_bytes, MapHash};
use super::PersistentMap;
use crate::storage::{self, registry, Reclaim};

/// Handle to an interned string: the byte offset of its cell in the blob.
/// Zero is never a valid cell offset and serves as the null handle.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(transparent)]
pub struct StrId(pub u32);

impl StrId {
    pub const NONE: StrId = StrId(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl MapHash for StrId {
    fn map_hash(&self) -> u64 {
        self.0.map_hash()
    }
}

const BLOB_HEADER: u64 = 16;
const INITIAL_BLOB_SIZE: usize = 4096;
const CELL_HEADER: usize = 8;

struct ArenaState {
    base: Option<NonNull<u8>>,
    mapped_size: usize,
    file: Option<File>,
}

struct ArenaCore {
    path: PathBuf,
    state: UnsafeCell<ArenaState>,
    in_use: AtomicBool,
    weak: Weak<ArenaCore>,
}

// SAFETY: ArenaState is only accessed while the in-use flag is held, which
// serializes the owning thread against the reclamation callback.
unsafe impl Send for ArenaCore {}
unsafe impl Sync for ArenaCore {}

pub struct StrArena {
    blob: Arc<ArenaCore>,
    index: PersistentMap<u64, StrId>,
}

impl StrArena {
    /// Opens (or lazily creates) the arena backed by `dir/<name>_str` plus
    /// its hash index at `dir/<name>_idx`.
    pub fn open(dir: impl AsRef<Path>, name: &str) -> Result<Self> {
        let dir = dir.as_ref();
        let index = PersistentMap::open(dir, &format!("{name}_idx"))?;
        let blob = Arc::new_cyclic(|weak| ArenaCore {
            path: dir.join(format!("{name}_str")),
            state: UnsafeCell::new(ArenaState {
                base: None,
                mapped_size: 0,
                file: None,
            }),
            in_use: AtomicBool::new(false),
            weak: weak.clone(),
        });
        Ok(StrArena { blob, index })
    }

    /// Interns `s`, returning the id of its unique cell. Idempotent: the
    /// same string always maps to the same id.
    pub fn intern(&self, s: &str) -> StrId {
        let h = hash_bytes(s.as_bytes());

        if !self.index.has(&h) {
            let id = self.blob.with(|arena| arena.append(s));
            self.index.set(h, id);
            return id;
        }

        let head = self.index.get(&h);
        self.blob.with(|arena| {
            let mut id = head;
            loop {
                if arena.cell_bytes(id) == s.as_bytes() {
                    return id;
                }
                let next = arena.cell_next(id);
                if next.is_none() {
                    let fresh = arena.append(s);
                    arena.set_cell_next(id, fresh);
                    return fresh;
                }
                id = next;
            }
        })
    }

    /// The id `s` would intern to, without interning it.
    pub fn lookup(&self, s: &str) -> Option<StrId> {
        let h = hash_bytes(s.as_bytes());
        if !self.index.has(&h) {
            return None;
        }
        let head = self.index.get(&h);
        self.blob.with(|arena| {
            let mut id = head;
            loop {
                if arena.cell_bytes(id) == s.as_bytes() {
                    return Some(id);
                }
                let next = arena.cell_next(id);
                if next.is_none() {
                    return None;
                }
                id = next;
            }
        })
    }

    /// The string behind `id`.
    ///
    /// # Panics
    /// If `id` did not come from this arena.
    pub fn resolve(&self, id: StrId) -> String {
        self.blob
            .with(|arena| String::from_utf8_lossy(arena.cell_bytes(id)).into_owned())
    }

    /// Number of distinct hash chains; equals the number of distinct
    /// strings in the absence of full 64-bit collisions.
    pub fn len(&self) -> u64 {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

/// Mapped window over the blob, only constructed under the in-use flag.
struct ArenaView {
    base: NonNull<u8>,
    mapped_size: usize,
}

impl ArenaCore {
    fn with<R>(&self, f: impl FnOnce(&mut Arena<'_>) -> R) -> R {
        while self.in_use.swap(true, Ordering::Acquire) {
            std::hint::spin_loop();
        }
        struct Unlock<'a>(&'a AtomicBool);
        impl Drop for Unlock<'_> {
            fn drop(&mut self) {
                self.0.store(false, Ordering::Release);
            }
        }
        let _unlock = Unlock(&self.in_use);
        let mut arena = Arena { core: self };
        f(&mut arena)
    }

    /// # Safety
    /// Caller must hold the in-use flag.
    #[allow(clippy::mut_from_ref)]
    unsafe fn state(&self) -> &mut ArenaState {
        &mut *self.state.get()
    }
}

impl Drop for ArenaCore {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        if let Some(base) = st.base.take() {
            registry().recycle(base);
        }
    }
}

impl Reclaim for ArenaCore {
    fn reclaim(&self, base: NonNull<u8>, _force: bool) -> bool {
        if self.in_use.swap(true, Ordering::Acquire) {
            return false;
        }
        // SAFETY: in_use just acquired.
        let st = unsafe { self.state() };
        let ours = st.base == Some(base);
        if ours {
            st.base = None;
            st.mapped_size = 0;
            st.file = None;
        }
        self.in_use.store(false, Ordering::Release);
        ours
    }
}

/// Operations on the blob while its lock is held.
struct Arena<'a> {
    core: &'a ArenaCore,
}

impl Arena<'_> {
    fn view(&mut self) -> ArenaView {
        // SAFETY: in_use held by ArenaCore::with.
        let st = unsafe { self.core.state() };
        if let Some(base) = st.base {
            return ArenaView {
                base,
                mapped_size: st.mapped_size,
            };
        }
        match self.remap(0) {
            Ok(view) => view,
            Err(err) => storage::fatal(err),
        }
    }

    /// Maps the blob at its current file size, or at `min_size` if larger.
    fn remap(&mut self, min_size: usize) -> Result<ArenaView> {
        // SAFETY: in_use held by ArenaCore::with.
        let st = unsafe { self.core.state() };
        debug_assert!(st.base.is_none());

        if st.file.is_none() {
            st.file = Some(registry().open(&self.core.path)?);
        }
        let file_len = st.file.as_ref().unwrap().metadata()?.len() as usize;
        let size = file_len.max(min_size).max(INITIAL_BLOB_SIZE);

        let owner: Weak<dyn Reclaim> = self.core.weak.clone();
        let (base, size) =
            registry().mmap(Some(&self.core.path), st.file.as_ref(), size, owner)?;
        st.base = Some(base);
        st.mapped_size = size;

        let view = ArenaView { base, mapped_size: size };
        if view.used() == 0 {
            view.set_used(BLOB_HEADER);
        }
        Ok(view)
    }

    fn append(&mut self, s: &str) -> StrId {
        let need = CELL_HEADER + s.len().next_multiple_of(8);

        let mut view = self.view();
        let used = view.used();
        if used as usize + need > view.mapped_size {
            let mut target = view.mapped_size * 2;
            while (used as usize + need) > target {
                target *= 2;
            }
            // SAFETY: in_use held by ArenaCore::with.
            let st = unsafe { self.core.state() };
            let old_base = st.base.take().expect("blob mapped by view()");
            st.mapped_size = 0;
            registry().release(old_base);
            view = match self.remap(target) {
                Ok(v) => v,
                Err(err) => storage::fatal(err),
            };
        }

        let off = used;
        if off + need as u64 > u32::MAX as u64 {
            storage::fatal(eyre::eyre!(
                "string arena '{}' exhausted the 32-bit id space",
                self.core.path.display()
            ));
        }

        view.write_cell(off as usize, s.as_bytes());
        view.set_used(off + need as u64);
        StrId(off as u32)
    }

    fn cell_bytes(&mut self, id: StrId) -> &[u8] {
        let view = self.view();
        let (ptr, len) = view.cell_span(id);
        // SAFETY: the mapping is pinned while the blob lock is held; the
        // returned borrow of self keeps the caller inside that window.
        unsafe { std::slice::from_raw_parts(ptr, len) }
    }

    fn cell_next(&mut self, id: StrId) -> StrId {
        let view = self.view();
        view.cell_next(id)
    }

    fn set_cell_next(&mut self, id: StrId, next: StrId) {
        let view = self.view();
        view.set_cell_next(id, next);
    }
}

impl ArenaView {
    fn used(&self) -> u64 {
        // SAFETY: the mapping is at least BLOB_HEADER bytes.
        u64::from_le(unsafe { (self.base.as_ptr() as *const u64).read() })
    }

    fn set_used(&self, used: u64) {
        // SAFETY: as in used().
        unsafe { (self.base.as_ptr() as *mut u64).write(used.to_le()) }
    }

    fn check_cell(&self, id: StrId) {
        let off = id.0 as u64;
        assert!(
            off >= BLOB_HEADER && off + CELL_HEADER as u64 <= self.used(),
            "string id {off} does not name a cell in this arena"
        );
    }

    fn cell_next(&self, id: StrId) -> StrId {
        self.check_cell(id);
        // SAFETY: check_cell bounds the offset against the used region.
        let raw = unsafe {
            (self.base.as_ptr().add(id.0 as usize) as *const u32).read_unaligned()
        };
        StrId(u32::from_le(raw))
    }

    fn set_cell_next(&self, id: StrId, next: StrId) {
        self.check_cell(id);
        // SAFETY: as in cell_next().
        unsafe {
            (self.base.as_ptr().add(id.0 as usize) as *mut u32)
                .write_unaligned(next.0.to_le())
        }
    }

    fn cell_len(&self, id: StrId) -> usize {
        self.check_cell(id);
        // SAFETY: as in cell_next(); the length word follows the link.
        let raw = unsafe {
            (self.base.as_ptr().add(id.0 as usize + 4) as *const u32).read_unaligned()
        };
        u32::from_le(raw) as usize
    }

    fn cell_span(&self, id: StrId) -> (*const u8, usize) {
        let len = self.cell_len(id);
        let start = id.0 as usize + CELL_HEADER;
        assert!(
            (start + len) as u64 <= self.used(),
            "string cell {} overruns the arena",
            id.0
        );
        // SAFETY: bounds asserted against the used region.
        (unsafe { self.base.as_ptr().add(start) as *const u8 }, len)
    }

    fn write_cell(&self, off: usize, bytes: &[u8]) {
        debug_assert!(off + CELL_HEADER + bytes.len() <= self.mapped_size);
        // SAFETY: append() sized the mapping to hold the cell; the cell is
        // fresh memory past every existing cell.
        unsafe {
            let p = self.base.as_ptr().add(off);
            (p as *mut u32).write_unaligned(0);
            (p.add(4) as *mut u32).write_unaligned((bytes.len() as u32).to_le());
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), p.add(CELL_HEADER), bytes.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_is_idempotent_and_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let arena = StrArena::open(dir.path(), "names").unwrap();

        let a = arena.intern("clock");
        let b = arena.intern("reset");
        let a2 = arena.intern("clock");

        assert_eq!(a, a2);
        assert_ne!(a, b);
        assert_eq!(arena.resolve(a), "clock");
        assert_eq!(arena.resolve(b), "reset");
        assert_eq!(arena.lookup("clock"), Some(a));
        assert_eq!(arena.lookup("enable"), None);
    }

    #[test]
    fn arena_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let ids: Vec<(String, StrId)> = {
            let arena = StrArena::open(dir.path(), "names").unwrap();
            (0..100)
                .map(|i| {
                    let s = format!("net_{i}");
                    let id = arena.intern(&s);
                    (s, id)
                })
                .collect()
        };

        let arena = StrArena::open(dir.path(), "names").unwrap();
        for (s, id) in ids {
            assert_eq!(arena.lookup(&s), Some(id), "{s}");
            assert_eq!(arena.resolve(id), s);
        }
    }

    #[test]
    fn arena_grows_past_initial_size() {
        let dir = tempfile::tempdir().unwrap();
        let arena = StrArena::open(dir.path(), "big").unwrap();

        let long = "x".repeat(512);
        let mut ids = Vec::new();
        for i in 0..64 {
            ids.push(arena.intern(&format!("{long}_{i}")));
        }
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(arena.resolve(*id), format!("{long}_{i}"));
        }
    }

    #[test]
    fn empty_string_interns() {
        let dir = tempfile::tempdir().unwrap();
        let arena = StrArena::open(dir.path(), "names").unwrap();
        let id = arena.intern("");
        assert!(!id.is_none());
        assert_eq!(arena.resolve(id), "");
    }
}

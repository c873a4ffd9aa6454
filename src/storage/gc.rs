//! # Region Registry and Cooperative Reclamation
//!
//! Process-wide table of live memory-mapped regions. Each region is owned
//! by exactly one data structure (a persistent map or a string arena) which
//! registers a [`Reclaim`] callback when it asks for the mapping. The
//! registry may unmap any region whose callback agrees; the callback's job
//! is to atomically detach the owner so it lazily re-maps on next access.
//!
//! ## Why a registry at all
//!
//! A graph library opens hundreds of maps but touches few of them in any
//! one pass. Keeping every map's region resident wastes address space and
//! page-table memory; unmapping behind the owner's back corrupts it. The
//! registry resolves the tension: owners stay oblivious until their next
//! access, and reclamation only proceeds when the owner's in-use flag can
//! be taken without contention.
//!
//! ## Region lifecycle
//!
//! ```text
//! mmap ──────────────► live ──┬── recycle (owner-driven, force) ──► unmapped
//!                             ├── release (post-rehash hand-off) ─► unmapped
//!                             └── sweep   (registry-driven)      ─► unmapped
//! ```
//!
//! `delete_file` unlinks a region's backing file while leaving the pages
//! mapped; the data dies for good when the region is later dropped.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Weak;

use eyre::{Result, WrapErr};
use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;

/// Owner side of the reclamation protocol.
///
/// `reclaim` must atomically detach the owner from the region rooted at
/// `base` and return true iff unmapping may proceed. It is invoked with the
/// registry lock held, possibly from another thread, so implementations may
/// only try-lock their own state and must not call back into the registry.
/// `force` is true for owner-driven teardown (`recycle`), where refusing is
/// a contract violation; sweeps pass false and accept refusal.
pub trait Reclaim: Send + Sync {
    fn reclaim(&self, base: NonNull<u8>, force: bool) -> bool;
}

struct Region {
    base: usize,
    // Dropping the MmapMut is what actually unmaps the pages.
    mmap: MmapMut,
    path: Option<PathBuf>,
    owner: Weak<dyn Reclaim>,
}

pub struct GcRegistry {
    regions: Mutex<Vec<Region>>,
}

static REGISTRY: GcRegistry = GcRegistry {
    regions: Mutex::new(Vec::new()),
};

/// The process-wide registry.
pub fn registry() -> &'static GcRegistry {
    &REGISTRY
}

impl GcRegistry {
    /// Opens (creating if absent) the backing file for a persistent region.
    pub fn open(&self, path: &Path) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .wrap_err_with(|| format!("failed to open backing file '{}'", path.display()))
    }

    /// Maps `size` bytes, file-backed when `path` is given, anonymous
    /// otherwise. The file is grown to `size` first; an existing larger
    /// file is left alone and only its first `size` bytes are mapped.
    ///
    /// On mapping failure one reclamation sweep is attempted before the
    /// error is surfaced, so address-space pressure from idle maps does not
    /// fail a live one.
    pub fn mmap(
        &self,
        path: Option<&Path>,
        file: Option<&File>,
        size: usize,
        owner: Weak<dyn Reclaim>,
    ) -> Result<(NonNull<u8>, usize)> {
        let mut regions = self.regions.lock();

        if let Some(file) = file {
            let file_len = file
                .metadata()
                .wrap_err("failed to stat backing file")?
                .len();
            if file_len < size as u64 {
                file.set_len(size as u64).wrap_err_with(|| {
                    format!("failed to grow backing file to {size} bytes")
                })?;
            }
        }

        let mut mmap = match Self::map_raw(file, size) {
            Ok(m) => m,
            Err(first) => {
                let dropped = Self::sweep_locked(&mut regions);
                tracing::debug!(dropped, "mmap failed, swept regions and retrying");
                Self::map_raw(file, size).wrap_err(first)?
            }
        };

        let base = mmap.as_mut_ptr();
        // SAFETY: MmapMut::as_mut_ptr never returns null for a non-empty
        // mapping; size is checked > 0 by map_raw.
        let base = unsafe { NonNull::new_unchecked(base) };

        Self::advise_willneed(base, size.min(4096));

        tracing::debug!(
            base = base.as_ptr() as usize,
            size,
            file = path.map(|p| p.display().to_string()),
            "mapped region"
        );

        regions.push(Region {
            base: base.as_ptr() as usize,
            mmap,
            path: path.map(Path::to_path_buf),
            owner,
        });

        Ok((base, size))
    }

    /// Owner-driven teardown of the region rooted at `base`. The owner's
    /// callback runs with `force = true` and must detach; the region is
    /// unmapped regardless of whether the owner is still alive.
    ///
    /// Callers must not hold their own in-use flag, otherwise the callback
    /// self-deadlocks on the try-lock and the detach is skipped.
    pub fn recycle(&self, base: NonNull<u8>) {
        let mut regions = self.regions.lock();
        let idx = Self::find(&regions, base).expect("recycle of unregistered region");

        if let Some(owner) = regions[idx].owner.upgrade() {
            let detached = owner.reclaim(base, true);
            debug_assert!(detached, "owner refused a forced recycle");
        }

        tracing::debug!(base = base.as_ptr() as usize, "recycled region");
        regions.swap_remove(idx);
    }

    /// Unmaps a region whose owner has already detached itself. This is the
    /// second phase of the rehash hand-off: no callback is invoked because
    /// the owner, by contract, no longer references the region.
    pub fn release(&self, base: NonNull<u8>) {
        let mut regions = self.regions.lock();
        let idx = Self::find(&regions, base).expect("release of unregistered region");
        tracing::debug!(base = base.as_ptr() as usize, "released region");
        regions.swap_remove(idx);
    }

    /// Unlinks the backing file of a mapped region. The pages stay mapped
    /// and usable until the region is reclaimed; only the name goes away.
    pub fn delete_file(&self, base: NonNull<u8>) -> Result<()> {
        let mut regions = self.regions.lock();
        let idx = Self::find(&regions, base).expect("delete_file of unregistered region");

        if let Some(path) = regions[idx].path.take() {
            std::fs::remove_file(&path)
                .wrap_err_with(|| format!("failed to unlink '{}'", path.display()))?;
        }
        Ok(())
    }

    /// Asks every region's owner to detach and unmaps those that agree.
    /// Returns the number of regions dropped.
    pub fn sweep(&self) -> usize {
        let mut regions = self.regions.lock();
        Self::sweep_locked(&mut regions)
    }

    /// Number of currently registered regions.
    pub fn len(&self) -> usize {
        self.regions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.lock().is_empty()
    }

    fn sweep_locked(regions: &mut Vec<Region>) -> usize {
        let before = regions.len();
        regions.retain(|r| {
            // SAFETY: r.base came from a live NonNull at registration.
            let base = unsafe { NonNull::new_unchecked(r.base as *mut u8) };
            let keep = match r.owner.upgrade() {
                // Owner gone without recycling: nothing can reference the
                // pages anymore, drop them.
                None => false,
                Some(owner) => !owner.reclaim(base, false),
            };
            if !keep {
                tracing::trace!(base = r.base, len = r.mmap.len(), "reclaimed region");
            }
            keep
        });
        let dropped = before - regions.len();
        if dropped > 0 {
            tracing::debug!(dropped, remaining = regions.len(), "reclamation sweep");
        }
        dropped
    }

    fn find(regions: &[Region], base: NonNull<u8>) -> Option<usize> {
        let addr = base.as_ptr() as usize;
        regions.iter().position(|r| r.base == addr)
    }

    fn map_raw(file: Option<&File>, size: usize) -> Result<MmapMut> {
        eyre::ensure!(size > 0, "cannot map an empty region");
        match file {
            // SAFETY: the file was opened read-write by this process and is
            // never truncated below `size` while mapped; all access goes
            // through the owning structure, which bounds every offset
            // against the layout recorded in the region's header.
            Some(file) => unsafe { MmapOptions::new().len(size).map_mut(file) }
                .wrap_err("mmap of backing file failed"),
            None => MmapOptions::new()
                .len(size)
                .map_anon()
                .wrap_err("anonymous mmap failed"),
        }
    }

    fn advise_willneed(base: NonNull<u8>, len: usize) {
        #[cfg(unix)]
        // SAFETY: madvise is advisory; base/len describe the prefix of a
        // mapping we just created, so the range is valid.
        unsafe {
            libc::madvise(base.as_ptr() as *mut libc::c_void, len, libc::MADV_WILLNEED);
        }
        #[cfg(not(unix))]
        let _ = (base, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    // The registry is process-global and other test modules map regions
    // concurrently, so these tests assert only on their own owners, never
    // on global region counts, and serialize their sweeps.
    static SWEEP_GATE: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

    struct TestOwner {
        allow: AtomicBool,
        detached: AtomicBool,
    }

    impl Reclaim for TestOwner {
        fn reclaim(&self, _base: NonNull<u8>, force: bool) -> bool {
            if force || self.allow.load(Ordering::Relaxed) {
                self.detached.store(true, Ordering::Relaxed);
                true
            } else {
                false
            }
        }
    }

    fn owner(allow: bool) -> (Arc<TestOwner>, Weak<dyn Reclaim>) {
        let owner = Arc::new(TestOwner {
            allow: AtomicBool::new(allow),
            detached: AtomicBool::new(false),
        });
        let weak_owner = Arc::downgrade(&owner);
        let weak: Weak<dyn Reclaim> = weak_owner;
        (owner, weak)
    }

    #[test]
    fn sweep_respects_owner_refusal() {
        let _gate = SWEEP_GATE.lock();
        let reg = registry();

        let (o, weak) = owner(false);
        let (_base, size) = reg.mmap(None, None, 4096, weak).unwrap();
        assert_eq!(size, 4096);

        reg.sweep();
        assert!(!o.detached.load(Ordering::Relaxed), "refusal ignored");

        o.allow.store(true, Ordering::Relaxed);
        reg.sweep();
        assert!(o.detached.load(Ordering::Relaxed));
    }

    #[test]
    fn recycle_forces_detach() {
        let reg = registry();
        let (o, weak) = owner(false);
        let (base, _) = reg.mmap(None, None, 4096, weak).unwrap();
        reg.recycle(base);
        assert!(o.detached.load(Ordering::Relaxed));
    }

    #[test]
    fn file_backed_region_grows_file_and_persists_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region.lgm");
        let reg = registry();

        let (_o, weak) = owner(true);
        let file = reg.open(&path).unwrap();
        let (base, size) = reg.mmap(Some(&path), Some(&file), 8192, weak).unwrap();
        assert_eq!(size, 8192);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 8192);

        // SAFETY: region is live and at least 8 bytes long.
        unsafe { base.as_ptr().cast::<u64>().write_unaligned(0xfeed_beefu64.to_le()) };
        reg.recycle(base);

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(u64::from_le_bytes(bytes[..8].try_into().unwrap()), 0xfeed_beef);
    }

    #[test]
    fn delete_file_keeps_mapping_live() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.lgm");
        let reg = registry();

        let (_o, weak) = owner(true);
        let file = reg.open(&path).unwrap();
        let (base, _) = reg.mmap(Some(&path), Some(&file), 4096, weak).unwrap();
        drop(file);

        reg.delete_file(base).unwrap();
        assert!(!path.exists());

        // Pages are still usable after the unlink.
        // SAFETY: region is live until the recycle below.
        unsafe { base.as_ptr().write(42) };
        reg.recycle(base);
    }
}

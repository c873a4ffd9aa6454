//! # Storage Module
//!
//! The storage layer owns every memory-mapped region in the process. Maps
//! and arenas never call `mmap` themselves; they ask the process-wide
//! [`GcRegistry`] for backing memory and register a reclamation callback in
//! exchange. That single choke point is what makes the rest of the system
//! work:
//!
//! - **Durability**: file-backed regions are plain shared mappings, so the
//!   kernel page cache is the write path and reopening a file after process
//!   restart observes the same bytes.
//! - **Reclamation**: when address space or an explicit recycle demands it,
//!   the registry walks its region table and asks each owner to detach.
//!   Owners that are mid-operation refuse, and the registry moves on.
//! - **Growth**: a table that outgrows its region gets a fresh, larger one
//!   and hands the old region back once it has migrated (two-phase rehash,
//!   see `map::core`).
//!
//! ## Locking
//!
//! Registry state is serialized by one mutex. Reclamation callbacks run
//! under that mutex on whatever thread triggered the sweep, so the owner
//! contract is strict: a callback may only try-lock its own state and must
//! never call back into the registry. Lock order is therefore always
//! registry, then owner, and the owner edge is non-blocking.

mod gc;

pub use gc::{registry, GcRegistry, Reclaim};

/// Aborts the process after logging a storage failure that leaves on-disk
/// state unrecoverable in-process (failed remap, lost backing file).
pub(crate) fn fatal(err: eyre::Report) -> ! {
    tracing::error!("unrecoverable storage failure: {err:#}");
    std::process::abort();
}

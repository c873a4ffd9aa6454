//! # On-Disk Map Header and Layout Arithmetic
//!
//! Every persistent map file starts with a fixed 40-byte header followed by
//! the info byte array and the record array. The header is the first thing
//! read on reload and the only place table geometry lives; nothing about a
//! map's shape is kept in process memory across an unmap.
//!
//! ## Layout
//!
//! Byte offsets from file start, all fields little-endian:
//!
//! ```text
//! 0x00  u64  mask             capacity - 1; capacity is a power of two
//! 0x08  u64  num_elements     live entry count
//! 0x10  u64  max_allowed      resize threshold (capacity * load factor)
//! 0x18  i32  info_inc         distance increment (padded to 8)
//! 0x20  i32  info_hash_shift  high-bit shift for the initial distance (padded to 8)
//! 0x28  u8[capacity + 1] info sentinel byte = 1, plus 8 slack bytes so the
//!                             iterator can issue whole-word loads
//! [8-byte boundary] record[capacity]
//! ```
//!
//! A fresh file (or one whose first word reads zero) is uninitialized; the
//! map seeds it at `INITIAL_NUM_ELEMENTS` capacity on first use.
//!
//! ## Zerocopy Safety
//!
//! The header struct uses zerocopy little-endian wrappers so the byte image
//! is identical on every supported platform. `Unaligned` is not required:
//! the header sits at offset zero of a page-aligned mapping.

use zerocopy::little_endian::{I32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Capacity a map is seeded with on first use. Part of the on-disk contract.
pub const INITIAL_NUM_ELEMENTS: usize = 1024;

/// Load factor numerator over 100. At 80% a power-of-two Robin Hood table
/// keeps mean probe distance low enough for the one-byte distance encoding.
pub const MAX_LOAD_FACTOR_100: u64 = 80;

/// Number of hash bits carried in a fresh info byte.
pub const INITIAL_INFO_NUM_BITS: u32 = 5;

/// Distance increment for a fresh table: one probe step costs this much in
/// the info byte, leaving the low `INITIAL_INFO_NUM_BITS` positions for the
/// hash bits.
pub const INITIAL_INFO_INC: u32 = 1 << INITIAL_INFO_NUM_BITS;

/// Shift that extracts the hash bits placed in a fresh info byte. Hashes are
/// 64-bit, so the top five bits ride in the byte. Incremented each time an
/// info bit is reclaimed for distance headroom.
pub const INITIAL_INFO_HASH_SHIFT: i32 = 64 - INITIAL_INFO_NUM_BITS as i32;

/// Size of the fixed header in bytes (five 8-byte words).
pub const HEADER_SIZE: usize = 40;

/// Byte offset of the info array.
pub const INFO_OFFSET: usize = HEADER_SIZE;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MapHeader {
    mask: U64,
    num_elements: U64,
    max_allowed: U64,
    info_inc: I32,
    _pad0: [u8; 4],
    info_hash_shift: I32,
    _pad1: [u8; 4],
}

const _: () = assert!(std::mem::size_of::<MapHeader>() == HEADER_SIZE);

impl MapHeader {
    #[inline]
    pub fn mask(&self) -> u64 {
        self.mask.get()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        (self.mask.get() + 1) as usize
    }

    #[inline]
    pub fn set_mask(&mut self, val: u64) {
        self.mask = U64::new(val);
    }

    #[inline]
    pub fn num_elements(&self) -> u64 {
        self.num_elements.get()
    }

    #[inline]
    pub fn set_num_elements(&mut self, val: u64) {
        self.num_elements = U64::new(val);
    }

    #[inline]
    pub fn max_allowed(&self) -> u64 {
        self.max_allowed.get()
    }

    #[inline]
    pub fn set_max_allowed(&mut self, val: u64) {
        self.max_allowed = U64::new(val);
    }

    #[inline]
    pub fn info_inc(&self) -> u32 {
        self.info_inc.get() as u32
    }

    #[inline]
    pub fn set_info_inc(&mut self, val: u32) {
        self.info_inc = I32::new(val as i32);
    }

    #[inline]
    pub fn info_hash_shift(&self) -> u32 {
        self.info_hash_shift.get() as u32
    }

    #[inline]
    pub fn set_info_hash_shift(&mut self, val: u32) {
        self.info_hash_shift = I32::new(val as i32);
    }
}

/// Resize threshold for a given capacity. Overflow-safe even for absurd
/// capacities near `u64::MAX`.
pub fn max_allowed_for(capacity: u64) -> u64 {
    const OVERFLOW_LIMIT: u64 = u64::MAX / 100;
    if capacity > OVERFLOW_LIMIT {
        (capacity as f64 * (MAX_LOAD_FACTOR_100 as f64 / 100.0)) as u64
    } else {
        capacity * MAX_LOAD_FACTOR_100 / 100
    }
}

/// Byte offset of the record array for a given capacity.
///
/// The info array owns `capacity + 1` bytes (sentinel included) plus slack
/// so that an 8-byte load at the sentinel stays in bounds; capacity is a
/// multiple of 8, so the record array lands back on an 8-byte boundary.
#[inline]
pub fn records_offset(capacity: usize) -> usize {
    HEADER_SIZE + capacity + 8
}

/// Total backing size for a table of `capacity` slots of `record_size`-byte
/// records.
#[inline]
pub fn backing_size(capacity: usize, record_size: usize) -> usize {
    records_offset(capacity) + capacity * record_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_forty_bytes_and_round_trips() {
        let mut h = MapHeader {
            mask: U64::new(1023),
            num_elements: U64::new(7),
            max_allowed: U64::new(819),
            info_inc: I32::new(INITIAL_INFO_INC as i32),
            _pad0: [0; 4],
            info_hash_shift: I32::new(INITIAL_INFO_HASH_SHIFT),
            _pad1: [0; 4],
        };
        h.set_num_elements(8);

        let bytes = zerocopy::IntoBytes::as_bytes(&h);
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(&bytes[..8], &1023u64.to_le_bytes());
        assert_eq!(&bytes[8..16], &8u64.to_le_bytes());
        assert_eq!(&bytes[24..28], &(INITIAL_INFO_INC as i32).to_le_bytes());

        let back = MapHeader::read_from_bytes(bytes).unwrap();
        assert_eq!(back.capacity(), 1024);
        assert_eq!(back.max_allowed(), 819);
        assert_eq!(back.info_hash_shift(), 59);
    }

    #[test]
    fn layout_arithmetic() {
        // 1024 slots, 16-byte records: info region is 1032 bytes, records
        // start 8-byte aligned right after.
        assert_eq!(records_offset(1024), 40 + 1024 + 8);
        assert_eq!(records_offset(1024) % 8, 0);
        assert_eq!(backing_size(1024, 16), 40 + 1032 + 1024 * 16);
        assert_eq!(max_allowed_for(1024), 819);
    }
}

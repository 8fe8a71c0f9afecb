//! Burst buckets: the trie leaves.
//!
//! A bucket is a 16-byte header followed by fixed-size metadata slots. The
//! header's `col_map` is the occupancy bitmap: bit `b` set means slot
//! `COLL_MAX - b` is live, so free slots are found with a highest-zero-bit
//! scan and the low bit positions double as the "full, must burst" signal.
//! Bits are acquired with an atomic fetch-or; once set, a bit disappears
//! only when the whole map is CAS-replaced (burst) or the bucket itself is
//! retired.
//!
//! The `next` field links reclaimed buckets on the per-worker free queue.

use std::sync::atomic::{AtomicU32, AtomicU64};

use crate::mapping::Mapping;
use crate::offset::{dalign, ralign};
use crate::ordering::{CAS_SUCCESS, READ_ORD, RELAXED};

/// Highest usable `col_map` bit position; strictly below the word width so
/// the highest-zero scan always finds a bit.
pub const COLL_MAX: u32 = 63;

/// Bit positions at or below this never map to slots; reaching them on a
/// free-slot scan means the bucket must burst.
pub const BURST_MIN_BITS: u32 = 2;

/// Metadata slots per bucket.
pub const BCKT_SLOTS_N: usize = (COLL_MAX - BURST_MIN_BITS) as usize;

/// Bucket header: occupancy map plus the free-queue link.
#[repr(C)]
pub struct BucketHdr {
    pub col_map: AtomicU64,
    pub next: AtomicU32,
    _pad: u32,
}

/// Header bytes in front of the slot array.
pub const BCKT_HDR_SZ: u64 = std::mem::size_of::<BucketHdr>() as u64;

const _: () = {
    assert!(BCKT_HDR_SZ == 16);
    assert!(COLL_MAX < u64::BITS);
    assert!(BCKT_SLOTS_N as u32 + BURST_MIN_BITS == COLL_MAX);
};

/// Slot occupied by `col_map` bit `bit`.
#[inline]
#[must_use]
pub const fn bit2slot(bit: u32) -> usize {
    (COLL_MAX - bit) as usize
}

/// `col_map` bit guarding `slot`.
#[inline]
#[must_use]
pub const fn slot2bit(slot: usize) -> u32 {
    COLL_MAX - slot as u32
}

/// Bitmap mask of `slot`.
#[inline]
#[must_use]
pub const fn slot_mask(slot: usize) -> u64 {
    1u64 << slot2bit(slot)
}

/// Highest zero bit of the map. The map never reaches all-ones (bit 0 is
/// below the burst floor), so the scan always finds one.
#[inline]
#[must_use]
pub fn flz(map: u64) -> u32 {
    63 - (!map).leading_zeros()
}

/// True when the free-bit scan has sunk to the burst floor.
#[inline]
#[must_use]
pub const fn burst_threshold(bit: u32) -> bool {
    bit <= BURST_MIN_BITS
}

/// Metadata slot size for a store mode.
#[inline]
#[must_use]
pub const fn slot_size(rec_len: u32, inplace: bool) -> u64 {
    if inplace {
        // Key word followed by the record body.
        ralign(8 + rec_len as u64)
    } else {
        // {key, data offset}.
        16
    }
}

/// Whole-bucket size at data granularity.
#[inline]
#[must_use]
pub const fn bucket_size(rec_len: u32, inplace: bool) -> u64 {
    dalign(BCKT_HDR_SZ + BCKT_SLOTS_N as u64 * slot_size(rec_len, inplace))
}

/// Byte offset of `slot` within the bucket at `bckt_off`.
#[inline]
#[must_use]
pub const fn slot_off(bckt_off: u64, slot: usize, slot_sz: u64) -> u64 {
    bckt_off + BCKT_HDR_SZ + slot as u64 * slot_sz
}

/// The header of the bucket at `bckt_off`.
#[inline]
pub(crate) fn hdr(map: &Mapping, bckt_off: u64) -> &BucketHdr {
    // SAFETY: bucket offsets are data-granularity aligned and validated
    // against the region on every descent.
    unsafe { map.cast::<BucketHdr>(bckt_off) }
}

/// Reset a bucket taken from the allocator or the reclamation queue.
pub(crate) fn init_bucket(map: &Mapping, bckt_off: u64) {
    let h = hdr(map, bckt_off);
    h.col_map.store(0, RELAXED);
    h.next.store(0, RELAXED);
}

/// Acquire a free slot: scan from the highest zero bit, fetch-or it, and
/// retry on a lost race. `None` means the bucket is at the burst floor.
pub(crate) fn acquire_slot(map: &Mapping, bckt_off: u64) -> Option<usize> {
    let cm = &hdr(map, bckt_off).col_map;
    loop {
        let bit = flz(cm.load(READ_ORD));
        if burst_threshold(bit) {
            return None;
        }
        if cm.fetch_or(1 << bit, CAS_SUCCESS) & (1 << bit) == 0 {
            return Some(bit2slot(bit));
        }
    }
}

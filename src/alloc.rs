//! Block allocator for the mapped region.
//!
//! The region past the root node is handed out in 4 KiB blocks from an
//! atomic bump cursor, with a lock-free free-block stack in front of it.
//! Workers carve index nodes, buckets and data chunks out of blocks through
//! per-worker write-combining watermarks, so the hot allocation path is a
//! pair of relaxed operations on worker-local state.
//!
//! The trie treats this module as a collaborator: it only relies on the
//! contract (aligned blocks, watermark bump, rollback of the most recent
//! carve, block recycling), not on the bump-cursor implementation.

use std::sync::atomic::AtomicU64;

use crate::lfstack::LfStack;
use crate::mapping::Mapping;
use crate::offset::{dalign, BLK_SZ, MINDREC};
use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, RELAXED};

/// Allocator state, embedded in the store header.
#[repr(C)]
pub struct AllocHdr {
    /// First byte of the block area.
    blocks_start: u64,

    /// One past the last allocatable byte (block-aligned).
    blocks_end: u64,

    /// Bump cursor over never-used blocks.
    next_blk: AtomicU64,

    /// Recycled blocks.
    free_blk: LfStack,
}

impl AllocHdr {
    pub(crate) const fn new(blocks_start: u64, blocks_end: u64) -> Self {
        Self {
            blocks_start,
            blocks_end,
            next_blk: AtomicU64::new(blocks_start),
            free_blk: LfStack::new(),
        }
    }

    /// Reserve one block, recycled blocks first.
    pub(crate) fn alloc_blk(&self, map: &Mapping) -> Option<u64> {
        // SAFETY: free-list entries are blocks previously owned by this
        // allocator inside `map`.
        if let Some((off, _)) = unsafe { self.free_blk.pop(map) } {
            return Some(off);
        }

        let mut cur = self.next_blk.load(RELAXED);
        loop {
            if cur + BLK_SZ > self.blocks_end {
                return None;
            }
            match self
                .next_blk
                .compare_exchange_weak(cur, cur + BLK_SZ, CAS_SUCCESS, CAS_FAILURE)
            {
                Ok(_) => return Some(cur),
                Err(now) => cur = now,
            }
        }
    }

    /// Return a whole block.
    pub(crate) fn free_blk(&self, map: &Mapping, off: u64) {
        debug_assert_eq!(off % BLK_SZ, 0);
        debug_assert!(off >= self.blocks_start && off + BLK_SZ <= self.blocks_end);
        // SAFETY: the caller owns the block; its first words become the
        // free-list entry.
        unsafe { self.free_blk.push(map, off, BLK_SZ as u32) };
    }
}

/// Block base of a watermark that has carved at least one byte.
#[inline]
fn wcl_block_base(wcl: u64) -> u64 {
    (wcl - 1) & !(BLK_SZ - 1)
}

/// Carve `size` bytes at `align` out of the worker's current block,
/// grabbing a fresh block when the current one cannot fit the request.
///
/// `size` must not exceed a block. The watermark pair is worker-local;
/// only the owning worker touches it, so the accesses are relaxed. `prev`
/// records the carve start so [`alloc_rollback`] can undo exactly this
/// allocation.
pub(crate) fn alloc_fix(
    alloc: &AllocHdr,
    map: &Mapping,
    wcl: &AtomicU64,
    prev: &AtomicU64,
    size: u64,
    align: u64,
) -> Option<u64> {
    debug_assert!(size <= BLK_SZ);
    debug_assert!(align.is_power_of_two());

    let cur = wcl.load(RELAXED);
    let mut target = (cur + align - 1) & !(align - 1);
    if cur == 0 || target + size > wcl_block_base(cur) + BLK_SZ {
        target = alloc.alloc_blk(map)?;
    }
    prev.store(target, RELAXED);
    wcl.store(target + size, RELAXED);
    Some(target)
}

/// Undo the most recent watermark carve: the next allocation reissues the
/// same bytes. A no-op when the last grant bypassed the watermark (cache
/// hit or whole block).
pub(crate) fn alloc_rollback(wcl: &AtomicU64, prev: &AtomicU64) {
    wcl.store(prev.load(RELAXED), RELAXED);
}

/// Disarm the rollback target after a grant that did not move the
/// watermark.
pub(crate) fn alloc_neutralize_rollback(wcl: &AtomicU64, prev: &AtomicU64) {
    prev.store(wcl.load(RELAXED), RELAXED);
}

/// Allocate a data region of at least `*len + overhead` bytes at data
/// granularity.
///
/// Requests that would not fit a block are satisfied with a whole block and
/// `*len` is reduced to the usable remainder; variable-length callers grow
/// such records by chaining further chunks.
pub(crate) fn alloc_data(
    alloc: &AllocHdr,
    map: &Mapping,
    wcl: &AtomicU64,
    prev: &AtomicU64,
    overhead: u64,
    len: &mut usize,
) -> Option<u64> {
    if *len as u64 + overhead >= BLK_SZ {
        let off = alloc.alloc_blk(map)?;
        *len = (BLK_SZ - overhead) as usize;
        alloc_neutralize_rollback(wcl, prev);
        return Some(off);
    }
    let size = dalign(*len as u64 + overhead);
    alloc_fix(alloc, map, wcl, prev, size, MINDREC)
}

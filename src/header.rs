//! The persisted store header.
//!
//! The header lives at offset 0 of the mapping: magic, mode flags, record
//! length, root fanout bits, the global generation counter, the per-worker
//! state array, the data-chunk cache heads and the allocator state. The
//! root index node follows at the next cache-line boundary, then the block
//! area. The layout is `repr(C)` end to end so a store image is a plain
//! byte region.

use std::sync::atomic::{AtomicU32, AtomicU64};

use crate::alloc::AllocHdr;
use crate::config::{StoreConfig, FLAG_INPLACE};
use crate::dcache::DCACHE_CLASSES;
use crate::error::InitError;
use crate::lfstack::LfStack;
use crate::mapping::Mapping;
use crate::offset::{blkalign, ialign, ii2o, o2ii, HTRIE_BITS, NODE_SZ};

/// Workers a store can register concurrently.
pub const MAX_WORKERS: usize = 64;

/// Identifies an initialized store image.
pub const MAGIC: u64 = u64::from_le_bytes(*b"HTRIEDB1");

/// Published epoch value meaning "not inside any operation".
pub const EPOCH_IDLE: u64 = u64::MAX;

/// Per-worker state.
///
/// Single-writer: only the owning worker mutates its slot. The epoch is the
/// one field other workers read (generation synchronization), so everything
/// is atomic and the non-epoch fields use relaxed accesses.
#[repr(C)]
pub struct WorkerSlot {
    /// Published generation; [`EPOCH_IDLE`] outside operations.
    pub epoch: AtomicU64,

    /// Write-combining watermark for index-node allocations.
    pub i_wcl: AtomicU64,

    /// Start of the most recent index-node carve; rollback target.
    pub i_wcl_prev: AtomicU64,

    /// Write-combining watermark for bucket allocations.
    pub b_wcl: AtomicU64,

    /// Start of the most recent bucket carve; rollback target.
    pub b_wcl_prev: AtomicU64,

    /// Write-combining watermark for data allocations.
    pub d_wcl: AtomicU64,

    /// Start of the most recent data carve; rollback target.
    pub d_wcl_prev: AtomicU64,

    /// Head of the reclaimed-bucket queue (data-granularity index, 0 empty).
    pub free_bckt_h: AtomicU32,

    /// Tail of the reclaimed-bucket queue.
    pub free_bckt_t: AtomicU32,
}

impl WorkerSlot {
    const fn new() -> Self {
        Self {
            epoch: AtomicU64::new(EPOCH_IDLE),
            i_wcl: AtomicU64::new(0),
            i_wcl_prev: AtomicU64::new(0),
            b_wcl: AtomicU64::new(0),
            b_wcl_prev: AtomicU64::new(0),
            d_wcl: AtomicU64::new(0),
            d_wcl_prev: AtomicU64::new(0),
            free_bckt_h: AtomicU32::new(0),
            free_bckt_t: AtomicU32::new(0),
        }
    }
}

/// Process-wide store state at offset 0 of the mapping.
#[repr(C)]
pub struct StoreHeader {
    pub(crate) magic: u64,
    pub(crate) flags: u32,
    pub(crate) rec_len: u32,
    pub(crate) root_bits: u32,
    _reserved: u32,

    /// Global generation counter gating reclamation.
    pub(crate) generation: AtomicU64,

    pub(crate) workers: [WorkerSlot; MAX_WORKERS],

    /// Size-classed free-lists for data chunks.
    pub(crate) dcache: [LfStack; DCACHE_CLASSES],

    pub(crate) alloc: AllocHdr,
}

/// Header size in bytes.
pub const HDR_SZ: u64 = std::mem::size_of::<StoreHeader>() as u64;

/// Byte offset of the root index node.
pub const ROOT_OFF: u64 = ialign(HDR_SZ);

const _: () = {
    assert!(std::mem::size_of::<WorkerSlot>() == 64);
    assert!(std::mem::align_of::<StoreHeader>() == 8);
    assert!(ROOT_OFF % NODE_SZ == 0);
};

impl StoreHeader {
    /// View the header of an initialized mapping.
    ///
    /// # Safety
    ///
    /// The mapping must hold an initialized store image.
    #[inline]
    pub(crate) unsafe fn get(map: &Mapping) -> &Self {
        map.cast::<Self>(0)
    }

    /// Root node size in bytes: `sizeof(node) << (root_bits - 4)`.
    #[inline]
    #[must_use]
    pub fn root_size(&self) -> u64 {
        NODE_SZ << (self.root_bits - HTRIE_BITS)
    }

    /// First byte of the block area.
    #[inline]
    #[must_use]
    pub fn blocks_start(&self) -> u64 {
        blkalign(ROOT_OFF + self.root_size())
    }

    #[inline]
    #[must_use]
    pub fn is_varlen(&self) -> bool {
        self.rec_len == 0
    }

    #[inline]
    #[must_use]
    pub fn is_inplace(&self) -> bool {
        self.flags & FLAG_INPLACE != 0
    }

    /// Lowest index-granularity index a shift may carry: anything below the
    /// block area is header or root.
    #[inline]
    #[must_use]
    pub fn min_shift_ii(&self) -> u32 {
        o2ii(self.blocks_start())
    }

    /// Initialize a fresh (zeroed) mapping with a validated config.
    pub(crate) fn init_mapping(map: &Mapping, cfg: &StoreConfig) -> Result<(), InitError> {
        let root_size = NODE_SZ << (cfg.root_bits - HTRIE_BITS);
        let blocks_start = blkalign(ROOT_OFF + root_size);
        let blocks_end = (map.len() as u64) & !(crate::offset::BLK_SZ - 1);
        // Room for the header, the root and something to allocate from.
        if blocks_start + crate::offset::BLK_SZ * 4 > blocks_end {
            return Err(InitError::RegionTooSmall(map.len()));
        }

        let hdr = Self {
            magic: MAGIC,
            flags: cfg.flags(),
            rec_len: cfg.rec_len,
            root_bits: cfg.root_bits,
            _reserved: 0,
            generation: AtomicU64::new(0),
            workers: std::array::from_fn(|_| WorkerSlot::new()),
            dcache: std::array::from_fn(|_| LfStack::new()),
            alloc: AllocHdr::new(blocks_start, blocks_end),
        };

        // SAFETY: the mapping is freshly allocated and exclusively ours; the
        // root area past the header is already zero-filled.
        unsafe {
            std::ptr::write(map.ptr(0).cast::<Self>(), hdr);
        }
        Ok(())
    }

    /// True if the first words of the mapping carry an initialized store.
    pub(crate) fn is_initialized(map: &Mapping) -> bool {
        if map.len() < HDR_SZ as usize {
            return false;
        }
        // SAFETY: in bounds; a plain word read.
        unsafe { std::ptr::read_volatile(map.ptr(0).cast::<u64>()) == MAGIC }
    }
}

/// Shift offsets must stay inside the block area and the mapping; anything
/// else is a corrupted edge.
#[inline]
pub(crate) fn check_edge(hdr: &StoreHeader, off: u64, map: &Mapping) {
    debug_assert!(
        off >= ii2o(hdr.min_shift_ii()) && off < map.len() as u64,
        "trie edge {off:#x} outside the block area"
    );
}

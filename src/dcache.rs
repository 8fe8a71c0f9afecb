//! Size-classed cache of freed data chunks.
//!
//! Freed payloads are pushed onto lock-free LIFO stacks and consulted
//! before the block allocator on the next allocation. Fixed-length stores
//! class by payload size over {256, 512, 1024, 2048}; variable-length
//! stores funnel every chunk through one shared stack. Payloads of a whole
//! block or more bypass the cache and return to the block allocator.

use crate::alloc;
use crate::header::{StoreHeader, WorkerSlot};
use crate::mapping::Mapping;
use crate::offset::{dalign, BLK_SZ};

/// Stacks in the cache array.
///
/// The class table maps sizes to indices {0, 2, 3, 4}; index 1 is laid out
/// but never selected.
pub const DCACHE_CLASSES: usize = 5;

/// Cache stack index for a payload of `sz` bytes, or `None` to bypass.
fn class_for(varlen: bool, sz: u64) -> Option<usize> {
    if varlen {
        return Some(0);
    }
    match sz {
        0..=256 => Some(0),
        257..=512 => Some(2),
        513..=1024 => Some(3),
        1025..=2048 => Some(4),
        _ => None,
    }
}

/// Chunk-header bytes in front of a variable-length payload.
#[inline]
pub(crate) fn data_overhead(hdr: &StoreHeader) -> u64 {
    if hdr.is_varlen() {
        crate::record::VARCHUNK_HDR
    } else {
        0
    }
}

/// Allocate a payload region for `w`, consulting the matching cache stack
/// first.
///
/// `*len` may shrink to the usable size when a whole block is taken.
pub(crate) fn alloc_data(
    hdr: &StoreHeader,
    map: &Mapping,
    w: &WorkerSlot,
    len: &mut usize,
) -> Option<u64> {
    let overhead = data_overhead(hdr);
    let want = *len as u64 + overhead;

    if want < BLK_SZ {
        if let Some(class) = class_for(hdr.is_varlen(), want) {
            let stack = &hdr.dcache[class];
            if !stack.is_empty() {
                // SAFETY: stack entries are chunks this store freed earlier.
                if let Some((off, cap)) = unsafe { stack.pop(map) } {
                    if u64::from(cap) >= dalign(want) {
                        // The watermark did not move; a rollback of this
                        // grant must be a no-op.
                        alloc::alloc_neutralize_rollback(&w.d_wcl, &w.d_wcl_prev);
                        return Some(off);
                    }
                    // Too small for this request; put it back for a better fit.
                    unsafe { stack.push(map, off, cap) };
                }
            }
        }
    }

    alloc::alloc_data(&hdr.alloc, map, &w.d_wcl, &w.d_wcl_prev, overhead, len)
}

/// Return a payload of `size` body bytes at `off` to the cache, or to the
/// block allocator when it occupies a whole block.
pub(crate) fn free_data(hdr: &StoreHeader, map: &Mapping, off: u64, size: u64) {
    let cap = dalign(size + data_overhead(hdr));
    if cap >= BLK_SZ {
        hdr.alloc.free_blk(map, off);
        return;
    }
    match class_for(hdr.is_varlen(), size) {
        // SAFETY: the caller owns the chunk after epoch synchronization.
        Some(class) => unsafe { hdr.dcache[class].push(map, off, cap as u32) },
        None => hdr.alloc.free_blk(map, off),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;

    fn store(cfg: StoreConfig) -> Mapping {
        let map = Mapping::anonymous(cfg.db_size).unwrap();
        StoreHeader::init_mapping(&map, &cfg).unwrap();
        map
    }

    #[test]
    fn fixed_classes_are_sparse() {
        assert_eq!(class_for(false, 16), Some(0));
        assert_eq!(class_for(false, 256), Some(0));
        assert_eq!(class_for(false, 257), Some(2));
        assert_eq!(class_for(false, 1000), Some(3));
        assert_eq!(class_for(false, 2048), Some(4));
        assert_eq!(class_for(false, 2049), None);
    }

    #[test]
    fn varlen_funnels_to_class_zero() {
        for sz in [1u64, 300, 2000, 3000] {
            assert_eq!(class_for(true, sz), Some(0));
        }
    }

    #[test]
    fn freed_chunk_is_reused() {
        let map = store(StoreConfig::fixed(1 << 20, 64));
        let hdr = unsafe { StoreHeader::get(&map) };
        let w = &hdr.workers[0];

        let mut len = 64usize;
        let a = alloc_data(hdr, &map, w, &mut len).unwrap();
        free_data(hdr, &map, a, 64);

        let mut len = 64usize;
        let b = alloc_data(hdr, &map, w, &mut len).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn undersized_cached_chunk_is_skipped() {
        let map = store(StoreConfig::varlen(1 << 20));
        let hdr = unsafe { StoreHeader::get(&map) };
        let w = &hdr.workers[0];

        let mut small = 32usize;
        let a = alloc_data(hdr, &map, w, &mut small).unwrap();
        free_data(hdr, &map, a, 32);

        // A bigger request must not be satisfied by the 32-byte chunk.
        let mut big = 1000usize;
        let b = alloc_data(hdr, &map, w, &mut big).unwrap();
        assert_ne!(a, b);
        assert_eq!(big, 1000);

        // The small chunk is still cached for a matching request.
        let mut small2 = 100usize;
        let c = alloc_data(hdr, &map, w, &mut small2).unwrap();
        assert_eq!(c, a);
    }
}

//! Lock-free LIFO stack of free region chunks.
//!
//! Used for the size-classed data-chunk cache and for the free-block list
//! of the allocator. Entries are data-granularity offsets; the first words
//! of a freed chunk are repurposed as the stack entry (`next` link plus the
//! chunk's recorded capacity). The head packs a 32-bit ABA tag next to the
//! 32-bit offset index so a single CAS covers both.

use std::sync::atomic::AtomicU64;

use crate::mapping::Mapping;
use crate::offset::{di2o, o2di};
use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, READ_ORD, RELAXED};

/// Entry header written over the first 8 bytes of a freed chunk.
#[repr(C)]
struct SEntry {
    /// Next chunk in the stack, as a data-granularity index; 0 ends the list.
    next: u32,
    /// Usable capacity of this chunk in bytes.
    size: u32,
}

/// A lock-free stack head, embedded in the store header.
#[repr(C)]
pub struct LfStack {
    /// `{aba_tag:u32 | head_di:u32}`; head 0 means empty.
    head: AtomicU64,
}

const DI_MASK: u64 = u32::MAX as u64;

impl LfStack {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: AtomicU64::new(0),
        }
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.load(READ_ORD) & DI_MASK == 0
    }

    /// Push the chunk at `off` (data-granularity aligned, at least 8 bytes)
    /// recording `size` bytes of capacity.
    ///
    /// # Safety
    ///
    /// `off` must be a valid, exclusively owned chunk inside `map`.
    pub unsafe fn push(&self, map: &Mapping, off: u64, size: u32) {
        let di = o2di(off);
        debug_assert_ne!(di, 0, "offset 0 is the store header");

        let mut head = self.head.load(RELAXED);
        loop {
            // Link before publish; the CAS releases the entry words.
            let entry = map.ptr(off).cast::<SEntry>();
            (*entry).next = (head & DI_MASK) as u32;
            (*entry).size = size;

            let new = next_tag(head) | u64::from(di);
            match self
                .head
                .compare_exchange_weak(head, new, CAS_SUCCESS, CAS_FAILURE)
            {
                Ok(_) => return,
                Err(cur) => head = cur,
            }
        }
    }

    /// Pop a chunk, returning its byte offset and recorded capacity.
    ///
    /// # Safety
    ///
    /// `map` must be the region this stack's entries live in.
    pub unsafe fn pop(&self, map: &Mapping) -> Option<(u64, u32)> {
        let mut head = self.head.load(READ_ORD);
        loop {
            let di = (head & DI_MASK) as u32;
            if di == 0 {
                return None;
            }
            let off = di2o(di);
            // The entry may be concurrently popped and reused; a stale read
            // here is rejected by the tagged CAS below.
            let entry = map.ptr(off).cast::<SEntry>();
            let next = std::ptr::read_volatile(std::ptr::addr_of!((*entry).next));
            let size = std::ptr::read_volatile(std::ptr::addr_of!((*entry).size));

            let new = next_tag(head) | u64::from(next);
            match self
                .head
                .compare_exchange_weak(head, new, CAS_SUCCESS, CAS_FAILURE)
            {
                Ok(_) => return Some((off, size)),
                Err(cur) => head = cur,
            }
        }
    }
}

impl Default for LfStack {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn next_tag(head: u64) -> u64 {
    (head & !DI_MASK).wrapping_add(1 << 32)
}

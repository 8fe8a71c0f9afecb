//! Index nodes: fixed-fanout child-slot arrays, one cache line each.
//!
//! An index node is sixteen 32-bit shifts. Slots are written exactly once
//! on the empty-to-child transition (install by CAS) and once more on the
//! bucket-to-node transition during a burst; they are never written back.
//! The root node is the same layout repeated `1 << (root_bits - 4)` times,
//! addressed as one flat run of slots.

use crate::mapping::Mapping;
use crate::offset::{Shift, FANOUT, NODE_SZ};
use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, READ_ORD, WRITE_ORD};

const _: () = assert!(FANOUT * 4 == NODE_SZ as usize);

/// Load the shift at `slot` of the node at `node_off`.
///
/// `slot` may exceed [`FANOUT`] for the flat root run.
#[inline]
pub(crate) fn load_shift(map: &Mapping, node_off: u64, slot: usize) -> Shift {
    // SAFETY: node offsets come from validated shifts or the root; slots
    // are 4-aligned words inside the node run.
    let raw = unsafe { map.atomic_u32(node_off + slot as u64 * 4) }.load(READ_ORD);
    Shift::from_raw(raw)
}

/// Store a shift into a node that is not yet published (burst assembly) or
/// whose readers tolerate late child linking (alias re-pointing).
#[inline]
pub(crate) fn store_shift(map: &Mapping, node_off: u64, slot: usize, s: Shift) {
    // SAFETY: as in `load_shift`.
    unsafe { map.atomic_u32(node_off + slot as u64 * 4) }.store(s.raw(), WRITE_ORD);
}

/// Install `new` at `slot` iff the slot still holds `old`.
#[inline]
pub(crate) fn cas_shift(map: &Mapping, node_off: u64, slot: usize, old: Shift, new: Shift) -> bool {
    // SAFETY: as in `load_shift`.
    unsafe { map.atomic_u32(node_off + slot as u64 * 4) }
        .compare_exchange(old.raw(), new.raw(), CAS_SUCCESS, CAS_FAILURE)
        .is_ok()
}

/// Zero a freshly allocated index node.
pub(crate) fn zero_node(map: &Mapping, node_off: u64) {
    debug_assert_eq!(node_off % NODE_SZ, 0);
    // SAFETY: the node was just carved from the allocator and is unshared.
    unsafe { map.zero(node_off, NODE_SZ as usize) };
}

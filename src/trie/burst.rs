//! Bucket burst: replacing a full leaf with a new index level.
//!
//! A burst builds a fresh index node whose children redistribute the
//! bucket's records by the next four key bits, publishes it with a CAS on
//! the parent edge, and then swaps the source bucket's collision map so
//! the records that moved out are logically freed. Readers racing the
//! burst see either the old bucket or the new subtree; both are consistent
//! because records are never mutated in place and the map only changes by
//! whole-word CAS.
//!
//! While the map swap is in flight the source bucket and the new buckets
//! intentionally double-reference the same records; the aliasing resolves
//! when the swap lands.

use crate::bucket::{self, BCKT_SLOTS_N};
use crate::header::WorkerSlot;
use crate::node;
use crate::offset::{key_idx, Shift, FANOUT};
use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, READ_ORD};
use crate::record;
use crate::tracing_helpers::engine_log;

use super::Htrie;

/// How a burst attempt ended.
pub(super) enum Outcome {
    /// The new level is published and redistributes at least one branch.
    Done,

    /// The new level is published but every record landed on one child;
    /// the caller should split one level deeper under `node`.
    Degenerate { node: u64 },

    /// Another writer changed the parent edge first; re-descend.
    Raced,

    /// No memory for the index node or a first-pass bucket.
    Oom,
}

/// Burst the full bucket at `bckt_off`, whose parent edge is
/// `(parent_off, parent_slot)`. `bits` is the key depth of the new level.
pub(super) fn burst(
    trie: &Htrie,
    w: &WorkerSlot,
    bckt_off: u64,
    parent_off: u64,
    parent_slot: usize,
    bits: u32,
) -> Outcome {
    let map = trie.map();

    let Some(node_off) = trie.alloc_index(w) else {
        return Outcome::Oom;
    };

    let cm = &bucket::hdr(map, bckt_off).col_map;
    let mut old_map = cm.load(READ_ORD);
    let mut new_map = 0u64;

    // First pass: the node is private, allocation failures abort cleanly.
    if !move_records(trie, w, bckt_off, old_map, bits, node_off, &mut new_map, false) {
        free_new_buckets(trie, w, node_off, bckt_off);
        trie.rollback_index(w);
        return Outcome::Oom;
    }

    // Publish the level. From here on the old bucket and the new buckets
    // double-reference the same records until the map swap below.
    if !node::cas_shift(
        map,
        parent_off,
        parent_slot,
        Shift::data(bckt_off),
        Shift::index(node_off),
    ) {
        free_new_buckets(trie, w, node_off, bckt_off);
        trie.rollback_index(w);
        return Outcome::Raced;
    }

    engine_log!(trace, bucket = bckt_off, node = node_off, bits, "burst published");

    // Swap the collision map. Concurrent inserters may still acquire bits
    // in the source; every new bit must be re-distributed before the swap
    // can land. The bucket gains bits during this loop but never loses any.
    loop {
        match cm.compare_exchange(old_map, new_map, CAS_SUCCESS, CAS_FAILURE) {
            Ok(_) => break,
            Err(cur) => {
                let delta = cur ^ old_map;
                move_records(trie, w, bckt_off, delta, bits, node_off, &mut new_map, true);
                old_map = cur;
            }
        }
    }

    if new_map == old_map {
        Outcome::Degenerate { node: node_off }
    } else {
        Outcome::Done
    }
}

/// Redistribute the records selected by `map_bits` into the node's
/// children. Bits of records that stay in the source bucket accumulate in
/// `new_map`.
///
/// With `no_mem_fail` (after the level is published) allocation failure
/// falls back to aliasing the source bucket: the record keeps its slot and
/// the next overflow retries the split.
#[allow(clippy::too_many_arguments)]
fn move_records(
    trie: &Htrie,
    w: &WorkerSlot,
    bckt_off: u64,
    map_bits: u64,
    bits: u32,
    node_off: u64,
    new_map: &mut u64,
    no_mem_fail: bool,
) -> bool {
    let map = trie.map();
    let ssz = trie.slot_sz();

    for s in 0..BCKT_SLOTS_N {
        let mask = bucket::slot_mask(s);
        if map_bits & mask == 0 {
            continue;
        }

        let soff = bucket::slot_off(bckt_off, s, ssz);
        let rkey = record::read_key(map, soff);
        let i = key_idx(rkey, bits);
        let cur = node::load_shift(map, node_off, i);

        if cur.is_empty() {
            if *new_map == 0 {
                // The first record stays put; its branch aliases the
                // source bucket.
                *new_map |= mask;
                node::store_shift(map, node_off, i, Shift::data(bckt_off));
            } else if let Some((nb, _)) = trie.alloc_bucket(w) {
                let copied = trie.copy_bucket_meta(nb, bckt_off, s);
                debug_assert!(copied, "fresh bucket cannot be full");
                node::store_shift(map, node_off, i, Shift::data(nb));
            } else if no_mem_fail {
                // The level is already fixed; link the branch back to the
                // source and hope the next overflow finds memory.
                *new_map |= mask;
                node::store_shift(map, node_off, i, Shift::data(bckt_off));
                crate::bump_burst_alias_counter();
                engine_log!(
                    warn,
                    bucket = bckt_off,
                    branch = i,
                    "burst aliased branch on alloc failure"
                );
            } else {
                return false;
            }
        } else if !cur.is_data() {
            // The branch bucket burst underneath us between passes; the
            // record stays live in the source instead of being written
            // into an index node.
            *new_map |= mask;
            crate::bump_burst_alias_counter();
        } else {
            // The branch exists: records bound for the source keep their
            // bit, the rest are copied into the branch bucket.
            let child = cur.bucket_off();
            if child == bckt_off {
                *new_map |= mask;
            } else if !trie.copy_bucket_meta(child, bckt_off, s) {
                // A concurrent inserter filled the sibling between passes;
                // keep the record live in the source rather than drop it.
                *new_map |= mask;
                crate::bump_burst_alias_counter();
                engine_log!(
                    warn,
                    bucket = bckt_off,
                    branch = i,
                    "sibling full, record kept in source"
                );
            }
        }
    }
    true
}

/// Undo an unpublished burst: recycle every bucket the node references
/// except the source alias. Nobody else has seen them.
fn free_new_buckets(trie: &Htrie, w: &WorkerSlot, node_off: u64, bckt_off: u64) {
    let map = trie.map();
    for i in 0..FANOUT {
        let s = node::load_shift(map, node_off, i);
        if s.is_data() && s.bucket_off() != bckt_off {
            trie.reclaim_bucket(w, s.bucket_off());
        }
        // Drop the link so a reused node never leaks a stale edge.
        node::store_shift(map, node_off, i, Shift::EMPTY);
    }
}

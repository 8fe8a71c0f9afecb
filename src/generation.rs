//! The generation protocol: passive quiescent-state reclamation.
//!
//! Every worker publishes the current global generation before touching the
//! trie and publishes [`EPOCH_IDLE`] when its outermost operation finishes.
//! A writer that wants to reclaim memory bumps the global generation and
//! spins until every other worker's published epoch exceeds the bumped
//! value — each of them is either idle or has started an operation that can
//! no longer reach the retired object.
//!
//! Readers pay one epoch store on entry and one on exit; there are no
//! per-object reference counts.

use crate::header::{StoreHeader, EPOCH_IDLE};
use crate::ordering::EPOCH_ORD;

/// Publish the current global generation into the worker's slot.
pub(crate) fn observe(hdr: &StoreHeader, worker: usize) {
    let gen = hdr.generation.load(EPOCH_ORD);
    hdr.workers[worker].epoch.store(gen, EPOCH_ORD);
}

/// Declare the worker idle.
pub(crate) fn release(hdr: &StoreHeader, worker: usize) {
    hdr.workers[worker].epoch.store(EPOCH_IDLE, EPOCH_ORD);
}

/// Advance the global generation and wait until every worker other than
/// the caller has moved past it.
///
/// Removers do not publish an epoch of their own, so two of them never
/// stall on each other here. The caller's slot is exempt anyway: any epoch
/// it carries belongs to an enclosing read bracket of the same worker, and
/// the caller is the exclusive unlinker of what it is about to reclaim.
pub(crate) fn synchronize(hdr: &StoreHeader, caller: usize) {
    let gen = hdr.generation.fetch_add(1, EPOCH_ORD) + 1;

    loop {
        let lagging = hdr
            .workers
            .iter()
            .enumerate()
            .any(|(i, w)| i != caller && w.epoch.load(EPOCH_ORD) <= gen);
        if !lagging {
            return;
        }
        std::hint::spin_loop();
    }
}

#[cfg(all(test, loom))]
mod loom_tests;

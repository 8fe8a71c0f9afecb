//! # htrie
//!
//! A cache-conscious burst hash trie: the index engine of an embedded,
//! in-memory, concurrent key-value store.
//!
//! Keys are fixed-width hash-like integers; the trie resolves four key
//! bits per level (low bits first, where hash entropy lives) and stores
//! many records per leaf in *burst buckets*. A full bucket bursts into a
//! new index level that redistributes its records by the next bit slice.
//! Duplicate keys are allowed and form a collision chain within a bucket.
//!
//! ## Design
//!
//! - Index nodes are one cache line of 16 tagged child slots, installed by
//!   CAS and never rewritten except for the one-way bucket-to-node
//!   transition.
//! - Buckets carry an occupancy bitmap (`col_map`); inserters acquire
//!   slots with an atomic bit fetch-or, and the bitmap only ever shrinks
//!   by whole-word CAS replacement during bursts and removes.
//! - All structures live in one pre-mapped region and reference each other
//!   by byte offset, with a high tag bit separating data from index space.
//! - Readers are wait-free and never block writers; storage retires
//!   through a generation protocol that waits for every worker to move
//!   past the retirement epoch.
//!
//! ## Modes
//!
//! A store keeps one of three record shapes, chosen at
//! [`StoreConfig`] time: fixed-length bodies inside the bucket slots
//! (*inplace*), fixed-length bodies behind a stable offset (*indirect*),
//! or variable-length chunk chains (*varlen*).
//!
//! ## Example
//!
//! ```rust
//! use htrie::{Htrie, StoreConfig};
//!
//! let store = Htrie::open(StoreConfig::varlen(1 << 20)).unwrap();
//! let w = store.worker().unwrap();
//!
//! w.insert(0xfeed, b"value").unwrap();
//! w.insert(0xfeed, b"another").unwrap();
//!
//! let bucket = w.lookup(0xfeed).unwrap();
//! assert_eq!(bucket.records(0xfeed).count(), 2);
//!
//! w.remove(0xfeed);
//! ```

pub mod bucket;
pub mod config;
pub mod error;
pub mod header;
pub mod offset;
pub mod ordering;

mod alloc;
mod dcache;
mod generation;
mod lfstack;
mod mapping;
mod node;
mod record;
mod tracing_helpers;
mod trie;

pub use config::StoreConfig;
pub use error::{InitError, InsertError};
pub use mapping::Mapping;
pub use trie::{BucketRef, ChunkIter, Htrie, RecordHandle, RecordRef, Worker};

use std::sync::atomic::{AtomicU64, Ordering};

/// Times a burst had to alias a branch back to its source bucket because
/// bucket allocation failed mid-split (or a sibling filled concurrently).
static BURST_ALIAS_NO_MEM: AtomicU64 = AtomicU64::new(0);

pub(crate) fn bump_burst_alias_counter() {
    BURST_ALIAS_NO_MEM.fetch_add(1, Ordering::Relaxed);
}

/// Diagnostic counter: burst alias fallbacks since the last reset.
///
/// A non-zero value means some index branches double-reference a bucket;
/// lookups stay correct, the split is just deferred to the next overflow.
#[must_use]
pub fn get_debug_counters() -> u64 {
    BURST_ALIAS_NO_MEM.load(Ordering::Relaxed)
}

/// Reset the diagnostic counters.
pub fn reset_debug_counters() {
    BURST_ALIAS_NO_MEM.store(0, Ordering::Relaxed);
}

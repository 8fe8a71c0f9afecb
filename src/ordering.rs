//! Standard memory orderings for concurrent trie access.
//!
//! These constants ensure consistent ordering usage across the codebase
//! and make the intent clear at each access point.

use std::sync::atomic::Ordering;

/// Ordering for reading index shifts and bucket maps during descent.
/// Pairs with writer's Release stores.
pub const READ_ORD: Ordering = Ordering::Acquire;

/// Ordering for publishing node fields.
/// Pairs with reader's Acquire loads.
pub const WRITE_ORD: Ordering = Ordering::Release;

/// Ordering for CAS success (compare-and-swap).
/// Used for index-slot installs, `col_map` replacement, chunk chaining.
pub const CAS_SUCCESS: Ordering = Ordering::AcqRel;

/// Ordering for CAS failure.
/// Only need to see the current value.
pub const CAS_FAILURE: Ordering = Ordering::Acquire;

/// Ordering for stores that are published by a later CAS or bit acquisition.
pub const RELAXED: Ordering = Ordering::Relaxed;

/// Ordering for the generation counter and the per-worker published epochs.
///
/// The reclamation protocol needs store-load visibility between a reader's
/// epoch publication and a writer's epoch scan. Neither a Release store nor
/// an Acquire load alone gives that, so both sides use `SeqCst`.
pub const EPOCH_ORD: Ordering = Ordering::SeqCst;

//! Record metadata slots and variable-length chunk chains.
//!
//! A metadata slot is `{key, data_offset}` for indirect and variable-length
//! stores, or `{key, body}` for inplace stores. Slot words are written
//! before the occupancy bit is acquired and rewritten once after winning
//! it; readers only look at slots whose bit they have observed, so the
//! fields are atomics with release publication.
//!
//! A variable-length payload is a chain of chunks, each
//! `{next_chunk, len}` followed by the bytes. Chains grow by a CAS on the
//! tail's `next_chunk`; a live chunk never moves, which is what makes the
//! records pointer-stable.

use std::sync::atomic::{AtomicU32, AtomicU64};

use crate::mapping::Mapping;
use crate::offset::di2o;
use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, READ_ORD, RELAXED, WRITE_ORD};

/// Chunk-header bytes: `{next_chunk: u32, len: u32}`.
pub const VARCHUNK_HDR: u64 = 8;

#[inline]
fn key_word(map: &Mapping, slot_off: u64) -> &AtomicU64 {
    // SAFETY: slot offsets are 8-aligned positions inside a bucket.
    unsafe { map.atomic_u64(slot_off) }
}

#[inline]
fn off_word(map: &Mapping, slot_off: u64) -> &AtomicU64 {
    // SAFETY: as in `key_word`; indirect slots are 16 bytes.
    unsafe { map.atomic_u64(slot_off + 8) }
}

/// Write an indirect metadata slot.
pub(crate) fn write_meta(map: &Mapping, slot_off: u64, key: u64, payload_off: u64) {
    key_word(map, slot_off).store(key, RELAXED);
    off_word(map, slot_off).store(payload_off, WRITE_ORD);
}

/// Write an inplace slot: the key word followed by the record body.
pub(crate) fn write_meta_inplace(map: &Mapping, slot_off: u64, key: u64, body: &[u8]) {
    key_word(map, slot_off).store(key, RELAXED);
    // SAFETY: the slot belongs to this bucket; racing speculative writers
    // target the same bytes and the winner rewrites after acquiring the
    // occupancy bit.
    unsafe { map.write_bytes(slot_off + 8, body) };
}

#[inline]
pub(crate) fn read_key(map: &Mapping, slot_off: u64) -> u64 {
    key_word(map, slot_off).load(READ_ORD)
}

#[inline]
pub(crate) fn read_off(map: &Mapping, slot_off: u64) -> u64 {
    off_word(map, slot_off).load(READ_ORD)
}

#[inline]
fn chunk_next_word(map: &Mapping, chunk_off: u64) -> &AtomicU32 {
    // SAFETY: chunk offsets are data-granularity aligned.
    unsafe { map.atomic_u32(chunk_off) }
}

#[inline]
fn chunk_len_word(map: &Mapping, chunk_off: u64) -> &AtomicU32 {
    // SAFETY: as in `chunk_next_word`.
    unsafe { map.atomic_u32(chunk_off + 4) }
}

/// Initialize a fresh chunk and copy the body in.
pub(crate) fn init_chunk(map: &Mapping, chunk_off: u64, body: &[u8]) {
    chunk_next_word(map, chunk_off).store(0, RELAXED);
    chunk_len_word(map, chunk_off).store(body.len() as u32, WRITE_ORD);
    // SAFETY: freshly allocated, unshared until linked.
    unsafe { map.write_bytes(chunk_off + VARCHUNK_HDR, body) };
}

/// Body length of the chunk.
#[inline]
pub(crate) fn chunk_len(map: &Mapping, chunk_off: u64) -> usize {
    chunk_len_word(map, chunk_off).load(READ_ORD) as usize
}

/// Next chunk in the chain, or 0.
#[inline]
pub(crate) fn chunk_next(map: &Mapping, chunk_off: u64) -> u64 {
    let di = chunk_next_word(map, chunk_off).load(READ_ORD);
    if di == 0 {
        0
    } else {
        di2o(di)
    }
}

/// Link `new_di` after the chunk iff it is still the chain tail.
#[inline]
pub(crate) fn chunk_try_append(map: &Mapping, chunk_off: u64, new_di: u32) -> bool {
    chunk_next_word(map, chunk_off)
        .compare_exchange(0, new_di, CAS_SUCCESS, CAS_FAILURE)
        .is_ok()
}

/// The chunk's body bytes.
#[inline]
pub(crate) fn chunk_body(map: &Mapping, chunk_off: u64) -> &[u8] {
    let len = chunk_len(map, chunk_off);
    // SAFETY: published chunk bodies are never mutated in place.
    unsafe { map.bytes(chunk_off + VARCHUNK_HDR, len) }
}

//! Error types for store initialization and record insertion.
//!
//! Contention retries are handled internally and never surfaced; the only
//! errors a caller sees are invalid configuration, allocation failure, and
//! key-space exhaustion.

use std::fmt as StdFmt;

/// Errors rejected at store initialization or worker registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitError {
    /// Requested mapping exceeds the maximum shard size (128 GiB).
    TooLarge(usize),

    /// Fixed record length exceeds half a block.
    RecordTooLong(u32),

    /// Root fanout bits must be a multiple of 4 and at least 4.
    BadRootBits(u32),

    /// Inplace mode requires a fixed record length.
    InplaceVarlen,

    /// An inplace bucket must fit in a single block; reduce the record
    /// length or give up the inplace requirement.
    InplaceBucketTooBig,

    /// The mapping has no room for the header, root node and at least one
    /// allocatable block.
    RegionTooSmall(usize),

    /// The backing allocation itself failed.
    MapFailed,

    /// All worker slots are registered.
    NoWorkerSlot,
}

impl StdFmt::Display for InitError {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        match self {
            Self::TooLarge(sz) => write!(f, "database size {sz} exceeds the maximum shard size"),

            Self::RecordTooLong(len) => write!(f, "record length {len} exceeds half a block"),

            Self::BadRootBits(bits) => {
                write!(f, "root bits {bits} must be a multiple of 4 and >= 4")
            }

            Self::InplaceVarlen => write!(f, "inplace records require a fixed record length"),

            Self::InplaceBucketTooBig => write!(f, "inplace bucket does not fit in one block"),

            Self::RegionTooSmall(sz) => write!(f, "region of {sz} bytes is too small for a store"),

            Self::MapFailed => write!(f, "backing region allocation failed"),

            Self::NoWorkerSlot => write!(f, "all worker slots are in use"),
        }
    }
}

impl std::error::Error for InitError {}

/// Errors that can occur during insert and extend operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertError {
    /// Empty records are not stored.
    EmptyRecord,

    /// Fixed-length stores only accept records of exactly `rec_len` bytes.
    BadRecordLength { expected: u32, got: usize },

    /// `extend_rec` is only meaningful for variable-length records.
    NotVariableLength,

    /// The allocator returned no block; partial allocations were rolled back.
    OutOfMemory,

    /// Every key bit is resolved and the collision bucket is full; there is
    /// no deeper level left to disambiguate this key.
    KeySpaceExhausted,
}

impl StdFmt::Display for InsertError {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        match self {
            Self::EmptyRecord => write!(f, "empty records are rejected"),

            Self::BadRecordLength { expected, got } => {
                write!(f, "fixed-length store expects {expected} bytes, got {got}")
            }

            Self::NotVariableLength => {
                write!(f, "cannot extend records in a fixed-length store")
            }

            Self::OutOfMemory => write!(f, "memory allocation failed"),

            Self::KeySpaceExhausted => {
                write!(f, "all key bits resolved and the collision bucket is full")
            }
        }
    }
}

impl std::error::Error for InsertError {}

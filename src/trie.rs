//! The burst hash trie engine.
//!
//! [`Htrie`] owns the mapped region; [`Worker`] is a per-thread handle that
//! publishes epochs and carries the worker-local allocator state. Readers
//! descend the trie wait-free; writers mutate it with single-slot CAS
//! operations and retire storage through the generation protocol.
//!
//! Keys are expected to be hashes: their entropy sits in the low-order
//! bits, and the trie consumes bits from low to high, four per level past
//! the root.

use std::cell::Cell;
use std::marker::PhantomData;

use parking_lot::Mutex;

use crate::alloc::{alloc_fix, alloc_rollback};
use crate::bucket::{self, BCKT_SLOTS_N};
use crate::config::StoreConfig;
use crate::dcache;
use crate::error::{InitError, InsertError};
use crate::generation;
use crate::header::{self, StoreHeader, WorkerSlot, MAX_WORKERS, ROOT_OFF};
use crate::mapping::Mapping;
use crate::node;
use crate::offset::{
    di2o, key_idx, key_resolved, o2di, Shift, FANOUT, HTRIE_BITS, MINDREC, NODE_SZ,
};
use crate::ordering::{CAS_SUCCESS, READ_ORD, RELAXED};
use crate::record;
use crate::tracing_helpers::engine_log;

mod burst;

// ============================================================================
//  Htrie
// ============================================================================

/// An embedded, in-memory, concurrent key-value index.
///
/// Records are keyed by a fixed-width hash-like integer; duplicate keys are
/// allowed and form a collision chain inside one bucket. Any number of
/// threads may insert, look up, iterate and remove concurrently through
/// per-thread [`Worker`] handles.
///
/// # Example
///
/// ```rust
/// use htrie::{Htrie, StoreConfig};
///
/// let store = Htrie::open(StoreConfig::varlen(1 << 20)).unwrap();
/// let w = store.worker().unwrap();
///
/// w.insert(0x1234, b"hello").unwrap();
///
/// let bucket = w.lookup(0x1234).unwrap();
/// let rec = bucket.records(0x1234).next().unwrap();
/// assert_eq!(rec.body(), b"hello");
/// ```
pub struct Htrie {
    map: Mapping,

    /// Bitmap of registered worker slots.
    registered: Mutex<u64>,
}

impl Htrie {
    /// Create a store over a fresh anonymous mapping.
    pub fn open(cfg: StoreConfig) -> Result<Self, InitError> {
        cfg.validate()?;
        let map = Mapping::anonymous(cfg.db_size)?;
        Self::from_mapping(map, cfg)
    }

    /// Adopt a mapping: initialize it unless it already carries a store
    /// image (identified by the header magic).
    pub fn from_mapping(map: Mapping, cfg: StoreConfig) -> Result<Self, InitError> {
        cfg.validate()?;
        if !StoreHeader::is_initialized(&map) {
            StoreHeader::init_mapping(&map, &cfg)?;
        }
        Ok(Self {
            map,
            registered: Mutex::new(0),
        })
    }

    #[inline]
    pub(crate) fn hdr(&self) -> &StoreHeader {
        // SAFETY: the constructor initialized the header.
        unsafe { StoreHeader::get(&self.map) }
    }

    #[inline]
    pub(crate) fn map(&self) -> &Mapping {
        &self.map
    }

    /// Fixed record length, 0 in variable-length mode.
    #[inline]
    #[must_use]
    pub fn rec_len(&self) -> u32 {
        self.hdr().rec_len
    }

    #[inline]
    #[must_use]
    pub fn is_varlen(&self) -> bool {
        self.hdr().is_varlen()
    }

    #[inline]
    #[must_use]
    pub fn is_inplace(&self) -> bool {
        self.hdr().is_inplace()
    }

    #[inline]
    #[must_use]
    pub fn root_bits(&self) -> u32 {
        self.hdr().root_bits
    }

    /// Register a worker slot for the calling thread.
    ///
    /// The handle is not `Send`: its epoch slot and allocation watermarks
    /// are single-writer state. The slot is released when the handle drops.
    pub fn worker(&self) -> Result<Worker<'_>, InitError> {
        let mut reg = self.registered.lock();
        let idx = (!*reg).trailing_zeros() as usize;
        if idx >= MAX_WORKERS {
            return Err(InitError::NoWorkerSlot);
        }
        *reg |= 1 << idx;
        Ok(Worker {
            trie: self,
            idx,
            nest: Cell::new(0),
            _not_send_sync: PhantomData,
        })
    }

    #[inline]
    fn slot_sz(&self) -> u64 {
        let hdr = self.hdr();
        bucket::slot_size(hdr.rec_len, hdr.is_inplace())
    }

    #[inline]
    fn bucket_bytes(&self) -> u64 {
        let hdr = self.hdr();
        bucket::bucket_size(hdr.rec_len, hdr.is_inplace())
    }

    // ------------------------------------------------------------------
    //  Descent
    // ------------------------------------------------------------------

    /// Walk from the root resolving key bits until a data edge or an empty
    /// slot. Read-only and wait-free. The returned `(node_off, slot)` pair
    /// addresses the edge that ended the walk, `bits` counts the key bits
    /// consumed up to (and excluding) the next level.
    pub(crate) fn descend(&self, key: u64) -> Descent {
        let hdr = self.hdr();
        let map = &self.map;

        let mut node_off = ROOT_OFF;
        let mut slot = (key & ((1u64 << hdr.root_bits) - 1)) as usize;
        let mut bits = hdr.root_bits;

        loop {
            let s = node::load_shift(map, node_off, slot);
            if s.is_empty() {
                return Descent {
                    node_off,
                    slot,
                    bits,
                    bucket: None,
                };
            }
            if s.is_data() {
                let off = s.bucket_off();
                header::check_edge(hdr, off, map);
                return Descent {
                    node_off,
                    slot,
                    bits,
                    bucket: Some(off),
                };
            }

            debug_assert!(!key_resolved(bits), "index level past the key width");
            node_off = s.node_off();
            header::check_edge(hdr, node_off, map);
            slot = key_idx(key, bits);
            bits += HTRIE_BITS;
        }
    }

    // ------------------------------------------------------------------
    //  Worker-local allocation
    // ------------------------------------------------------------------

    /// Allocate and zero one index node.
    pub(crate) fn alloc_index(&self, w: &WorkerSlot) -> Option<u64> {
        let off = alloc_fix(
            &self.hdr().alloc,
            &self.map,
            &w.i_wcl,
            &w.i_wcl_prev,
            NODE_SZ,
            NODE_SZ,
        )?;
        node::zero_node(&self.map, off);
        Some(off)
    }

    pub(crate) fn rollback_index(&self, w: &WorkerSlot) {
        alloc_rollback(&w.i_wcl, &w.i_wcl_prev);
    }

    /// Allocate a bucket, the reclamation queue first. The flag reports a
    /// queue hit so a failed install knows how to undo itself.
    pub(crate) fn alloc_bucket(&self, w: &WorkerSlot) -> Option<(u64, bool)> {
        let head = w.free_bckt_h.load(RELAXED);
        if head != 0 {
            let off = di2o(head);
            let next = bucket::hdr(&self.map, off).next.load(RELAXED);
            w.free_bckt_h.store(next, RELAXED);
            if next == 0 {
                w.free_bckt_t.store(0, RELAXED);
            }
            bucket::init_bucket(&self.map, off);
            return Some((off, true));
        }

        let off = alloc_fix(
            &self.hdr().alloc,
            &self.map,
            &w.b_wcl,
            &w.b_wcl_prev,
            self.bucket_bytes(),
            MINDREC,
        )?;
        bucket::init_bucket(&self.map, off);
        Some((off, false))
    }

    pub(crate) fn rollback_bucket(&self, w: &WorkerSlot) {
        alloc_rollback(&w.b_wcl, &w.b_wcl_prev);
    }

    /// Queue a bucket on the worker's free tail. The caller must be the
    /// exclusive owner (fresh allocation, or retired after an epoch wait).
    pub(crate) fn reclaim_bucket(&self, w: &WorkerSlot, off: u64) {
        let di = o2di(off);
        bucket::hdr(&self.map, off).next.store(0, RELAXED);

        let tail = w.free_bckt_t.load(RELAXED);
        if tail != 0 {
            bucket::hdr(&self.map, di2o(tail)).next.store(di, RELAXED);
            w.free_bckt_t.store(di, RELAXED);
        } else {
            w.free_bckt_h.store(di, RELAXED);
            w.free_bckt_t.store(di, RELAXED);
        }
    }

    // ------------------------------------------------------------------
    //  Slot metadata
    // ------------------------------------------------------------------

    /// Write the metadata (or the inplace record) for `slot`.
    fn write_bucket_meta(
        &self,
        bckt_off: u64,
        slot: usize,
        key: u64,
        data: &[u8],
        len: usize,
        payload: u64,
    ) {
        let soff = bucket::slot_off(bckt_off, slot, self.slot_sz());
        if self.hdr().is_inplace() {
            record::write_meta_inplace(&self.map, soff, key, &data[..len]);
        } else {
            record::write_meta(&self.map, soff, key, payload);
        }
    }

    /// Copy the metadata of `src_slot` into a freshly acquired slot of
    /// `dst`. Fails only when `dst` is at the burst floor.
    pub(crate) fn copy_bucket_meta(&self, dst: u64, src: u64, src_slot: usize) -> bool {
        let Some(d_slot) = bucket::acquire_slot(&self.map, dst) else {
            return false;
        };
        let ssz = self.slot_sz();
        let s_off = bucket::slot_off(src, src_slot, ssz);
        let d_off = bucket::slot_off(dst, d_slot, ssz);

        if self.hdr().is_inplace() {
            let key = record::read_key(&self.map, s_off);
            let body_len = self.hdr().rec_len as usize;
            // SAFETY: the source slot is live (bit observed by the caller)
            // and its body is never mutated in place; the ranges are in
            // distinct buckets.
            let body = unsafe { self.map.bytes(s_off + 8, body_len) };
            record::write_meta_inplace(&self.map, d_off, key, body);
        } else {
            let key = record::read_key(&self.map, s_off);
            let off = record::read_off(&self.map, s_off);
            record::write_meta(&self.map, d_off, key, off);
        }
        true
    }
}

/// Where a descent stopped.
pub(crate) struct Descent {
    /// Node holding the final edge (the root run or an index node).
    pub node_off: u64,
    /// Slot index of the final edge within that node.
    pub slot: usize,
    /// Key bits consumed; the next level would decode `key >> bits`.
    pub bits: u32,
    /// Bucket offset when the edge carries data.
    pub bucket: Option<u64>,
}

// ============================================================================
//  Worker
// ============================================================================

/// Per-thread handle to a store.
///
/// Operations publish the worker's epoch on entry and clear it when the
/// outermost bracket closes, so a held [`BucketRef`] keeps the epoch
/// published across nested calls.
pub struct Worker<'h> {
    trie: &'h Htrie,
    idx: usize,
    nest: Cell<u32>,

    /// Worker-local state (epoch slot, watermarks) is single-writer; keep
    /// the handle on its thread.
    _not_send_sync: PhantomData<*mut ()>,
}

impl Drop for Worker<'_> {
    fn drop(&mut self) {
        *self.trie.registered.lock() &= !(1u64 << self.idx);
    }
}

impl<'h> Worker<'h> {
    #[inline]
    fn slot(&self) -> &'h WorkerSlot {
        &self.trie.hdr().workers[self.idx]
    }

    /// The store this worker belongs to.
    #[inline]
    #[must_use]
    pub fn store(&self) -> &'h Htrie {
        self.trie
    }

    fn epoch_enter(&self) -> EpochGuard<'_> {
        if self.nest.get() == 0 {
            generation::observe(self.trie.hdr(), self.idx);
        }
        self.nest.set(self.nest.get() + 1);
        EpochGuard {
            hdr: self.trie.hdr(),
            worker: self.idx,
            nest: &self.nest,
        }
    }

    // ------------------------------------------------------------------
    //  Insert
    // ------------------------------------------------------------------

    /// Insert a record. Duplicate keys are allowed; each insert adds one
    /// record to the key's collision chain.
    ///
    /// In variable-length mode the stored body may be shorter than `data`
    /// when the first chunk caps at a block; the returned handle reports
    /// the stored length and the record can be grown with
    /// [`extend_rec`](Self::extend_rec).
    ///
    /// For inplace stores the handle's offset is only meaningful as a
    /// success indicator: inplace bodies move when their bucket bursts.
    pub fn insert(&self, key: u64, data: &[u8]) -> Result<RecordHandle, InsertError> {
        let hdr = self.trie.hdr();
        if data.is_empty() {
            return Err(InsertError::EmptyRecord);
        }
        if !hdr.is_varlen() && data.len() != hdr.rec_len as usize {
            return Err(InsertError::BadRecordLength {
                expected: hdr.rec_len,
                got: data.len(),
            });
        }

        let _guard = self.epoch_enter();
        let w = self.slot();
        let mut len = data.len();
        let mut payload = 0u64;

        if !hdr.is_inplace() {
            payload = dcache::alloc_data(hdr, &self.trie.map, w, &mut len)
                .ok_or(InsertError::OutOfMemory)?;
            if hdr.is_varlen() {
                record::init_chunk(&self.trie.map, payload, &data[..len]);
            } else {
                // SAFETY: freshly allocated payload, unshared until the
                // metadata slot is published.
                unsafe { self.trie.map.write_bytes(payload, data) };
            }
        }

        match self.insert_rec(key, data, len, payload) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                if !hdr.is_inplace() {
                    alloc_rollback(&w.d_wcl, &w.d_wcl_prev);
                }
                Err(e)
            }
        }
    }

    fn insert_rec(
        &self,
        key: u64,
        data: &[u8],
        len: usize,
        payload: u64,
    ) -> Result<RecordHandle, InsertError> {
        let trie = self.trie;
        let map = &trie.map;
        let w = self.slot();

        'restart: loop {
            let d = trie.descend(key);

            let Some(bckt_off) = d.bucket else {
                // The index does not have the key: install a fresh bucket.
                let Some((b, from_queue)) = trie.alloc_bucket(w) else {
                    return Err(InsertError::OutOfMemory);
                };
                trie.write_bucket_meta(b, 0, key, data, len, payload);
                bucket::hdr(map, b)
                    .col_map
                    .store(bucket::slot_mask(0), RELAXED);

                if node::cas_shift(map, d.node_off, d.slot, Shift::EMPTY, Shift::data(b)) {
                    engine_log!(trace, key, bucket = b, "installed fresh bucket");
                    return Ok(self.handle(b, 0, key, len, payload));
                }
                // Somebody created the branch first; undo and retry.
                if from_queue {
                    trie.reclaim_bucket(w, b);
                } else {
                    trie.rollback_bucket(w);
                }
                continue 'restart;
            };

            // Collision: the edge references a bucket.
            if let Some(slot) = self.bckt_insert_rec(bckt_off, key, data, len, payload) {
                return Ok(self.handle(bckt_off, slot, key, len, payload));
            }

            // The bucket is full: burst it and resume on the new level.
            let mut bits = d.bits;
            let mut node_off = d.node_off;
            let mut nslot = d.slot;
            loop {
                if key_resolved(bits) {
                    engine_log!(
                        error,
                        key,
                        "all bits of the key resolved and the collision bucket is full"
                    );
                    return Err(InsertError::KeySpaceExhausted);
                }
                match burst::burst(trie, w, bckt_off, node_off, nslot, bits) {
                    burst::Outcome::Done | burst::Outcome::Raced => continue 'restart,
                    burst::Outcome::Oom => return Err(InsertError::OutOfMemory),
                    burst::Outcome::Degenerate { node } => {
                        // Every record went to one child; split a level
                        // deeper under the fresh node.
                        engine_log!(debug, key, bits, "degenerate burst, retrying one level down");
                        node_off = node;
                        nslot = key_idx(key, bits);
                        bits += HTRIE_BITS;
                    }
                }
            }
        }
    }

    /// Place a record in a bucket with free room: write the metadata
    /// speculatively, then take the slot's bit; on a lost race move to the
    /// next free bit. `None` means the bucket is at the burst floor.
    fn bckt_insert_rec(
        &self,
        bckt_off: u64,
        key: u64,
        data: &[u8],
        len: usize,
        payload: u64,
    ) -> Option<usize> {
        let cm = &bucket::hdr(&self.trie.map, bckt_off).col_map;
        let mut bit = bucket::flz(cm.load(READ_ORD));

        loop {
            if bucket::burst_threshold(bit) {
                return None;
            }
            let slot = bucket::bit2slot(bit);
            self.trie
                .write_bucket_meta(bckt_off, slot, key, data, len, payload);

            if cm.fetch_or(1 << bit, CAS_SUCCESS) & (1 << bit) == 0 {
                // We won the bit; the speculative write may have been
                // overwritten by a racing inserter that lost it.
                self.trie
                    .write_bucket_meta(bckt_off, slot, key, data, len, payload);
                return Some(slot);
            }
            bit = bucket::flz(cm.load(READ_ORD));
        }
    }

    fn handle(&self, bckt_off: u64, slot: usize, key: u64, len: usize, payload: u64) -> RecordHandle {
        let off = if self.trie.hdr().is_inplace() {
            bucket::slot_off(bckt_off, slot, self.trie.slot_sz())
        } else {
            payload
        };
        RecordHandle { key, off, len }
    }

    // ------------------------------------------------------------------
    //  Lookup and iteration
    // ------------------------------------------------------------------

    /// Look a key up, returning a handle to its bucket (collision chain).
    ///
    /// The bucket may hold records of other keys as well; scan it with
    /// [`BucketRef::scan_for_rec`] or [`BucketRef::records`]. The epoch
    /// stays published until the returned handle drops.
    pub fn lookup(&self, key: u64) -> Option<BucketRef<'_>> {
        let guard = self.epoch_enter();
        let d = self.trie.descend(key);
        d.bucket.map(|bckt_off| BucketRef {
            trie: self.trie,
            bckt_off,
            _guard: guard,
        })
    }

    /// Depth-first visit of every live record body.
    ///
    /// An error from the visitor stops the walk and propagates. Recursion
    /// depth is bounded by `(64 - root_bits) / 4 + 1`.
    pub fn walk<E, F>(&self, mut f: F) -> Result<(), E>
    where
        F: FnMut(&[u8]) -> Result<(), E>,
    {
        let _guard = self.epoch_enter();
        let fanout = 1usize << self.trie.hdr().root_bits;
        self.visit_node(ROOT_OFF, fanout, &mut f)
    }

    fn visit_node<E, F>(&self, node_off: u64, fanout: usize, f: &mut F) -> Result<(), E>
    where
        F: FnMut(&[u8]) -> Result<(), E>,
    {
        let map = &self.trie.map;
        for i in 0..fanout {
            let s = node::load_shift(map, node_off, i);
            if s.is_empty() {
                continue;
            }
            if s.is_data() {
                self.walk_bucket(s.bucket_off(), f)?;
            } else {
                self.visit_node(s.node_off(), FANOUT, f)?;
            }
        }
        Ok(())
    }

    fn walk_bucket<E, F>(&self, bckt_off: u64, f: &mut F) -> Result<(), E>
    where
        F: FnMut(&[u8]) -> Result<(), E>,
    {
        let map = &self.trie.map;
        let hdr = self.trie.hdr();
        let ssz = self.trie.slot_sz();
        let cm = bucket::hdr(map, bckt_off).col_map.load(READ_ORD);

        for s in 0..BCKT_SLOTS_N {
            if cm & bucket::slot_mask(s) == 0 {
                continue;
            }
            let soff = bucket::slot_off(bckt_off, s, ssz);
            let body = record_body(map, hdr, soff);
            f(body)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    //  Remove
    // ------------------------------------------------------------------

    /// Delete every record whose key equals `key` and reclaim their
    /// payloads.
    ///
    /// The leaf bucket is replaced copy-on-write: survivors move to a fresh
    /// bucket, the parent edge is swung with a CAS, and the old bucket and
    /// the dead payloads are reclaimed once every other worker has moved
    /// past the bumped generation.
    pub fn remove(&self, key: u64) {
        let trie = self.trie;
        let map = &trie.map;
        let hdr = trie.hdr();
        let w = self.slot();

        let Some((b_new, _)) = trie.alloc_bucket(w) else {
            return;
        };

        // No epoch bracket of our own: a published epoch here would stall a
        // concurrent remover's generation wait on us while we wait on it.
        // The descent below tolerates racing reclamation because buckets
        // are recycled inside the region and the parent CAS re-validates
        // the edge.
        let ssz = trie.slot_sz();
        let mut reclaim = [0u64; BCKT_SLOTS_N];

        let (b_old, nr) = loop {
            let d = trie.descend(key);
            let Some(b_off) = d.bucket else {
                trie.reclaim_bucket(w, b_new);
                return;
            };

            // Unlink by copy: the collision map of a live bucket never
            // loses bits, so survivors are copied out and the whole bucket
            // is swapped instead.
            let mut nr = 0;
            let cm = bucket::hdr(map, b_off).col_map.load(READ_ORD);
            for s in 0..BCKT_SLOTS_N {
                if cm & bucket::slot_mask(s) == 0 {
                    continue;
                }
                let soff = bucket::slot_off(b_off, s, ssz);
                if record::read_key(map, soff) != key {
                    let copied = trie.copy_bucket_meta(b_new, b_off, s);
                    debug_assert!(copied, "replacement bucket cannot be smaller");
                } else if !hdr.is_inplace() {
                    reclaim[nr] = record::read_off(map, soff);
                    nr += 1;
                }
            }

            if node::cas_shift(map, d.node_off, d.slot, Shift::data(b_off), Shift::data(b_new)) {
                break (b_off, nr);
            }
            // The edge moved under us; reset the replacement and retry.
            bucket::init_bucket(map, b_new);
        };

        engine_log!(trace, key, bucket = b_old, survivors = b_new, "bucket replaced");

        // Wait until no reader can still hold the old bucket, then recycle
        // it and the dead payloads. Our own slot is exempt: the epoch it
        // may carry belongs to an enclosing lookup of this same worker.
        generation::synchronize(hdr, self.idx);

        trie.reclaim_bucket(w, b_old);
        if !hdr.is_inplace() {
            for &off in &reclaim[..nr] {
                if hdr.is_varlen() {
                    let mut chunk = off;
                    while chunk != 0 {
                        let next = record::chunk_next(map, chunk);
                        let len = record::chunk_len(map, chunk);
                        dcache::free_data(hdr, map, chunk, len as u64);
                        chunk = next;
                    }
                } else {
                    dcache::free_data(hdr, map, off, u64::from(hdr.rec_len));
                }
            }
        }
    }

    // ------------------------------------------------------------------
    //  Extend
    // ------------------------------------------------------------------

    /// Append a chunk to a variable-length record's chain.
    ///
    /// Meant to grow a record just inserted by this worker; the chain tail
    /// is found by walking `rec`'s chunks. The stored length may cap at a
    /// block, as in [`insert`](Self::insert).
    ///
    /// The returned handle describes the appended tail chunk, not the
    /// record head: keep the handle from `insert` to address the whole
    /// chain, and use this one to keep extending or to locate the new
    /// chunk's bytes.
    pub fn extend_rec(
        &self,
        rec: &RecordHandle,
        data: &[u8],
    ) -> Result<RecordHandle, InsertError> {
        let trie = self.trie;
        let hdr = trie.hdr();
        if !hdr.is_varlen() {
            return Err(InsertError::NotVariableLength);
        }
        if data.is_empty() {
            return Err(InsertError::EmptyRecord);
        }

        let _guard = self.epoch_enter();
        let w = self.slot();
        let mut len = data.len();
        let chunk =
            dcache::alloc_data(hdr, &trie.map, w, &mut len).ok_or(InsertError::OutOfMemory)?;
        record::init_chunk(&trie.map, chunk, &data[..len]);

        // Chase the tail; a racing extender moves it, so retry the append.
        let mut tail = rec.off;
        loop {
            let next = record::chunk_next(&trie.map, tail);
            if next != 0 {
                tail = next;
                continue;
            }
            if record::chunk_try_append(&trie.map, tail, o2di(chunk)) {
                break;
            }
        }

        Ok(RecordHandle {
            key: rec.key,
            off: chunk,
            len,
        })
    }
}

/// Body bytes of the record whose metadata slot is at `soff`.
fn record_body<'m>(map: &'m Mapping, hdr: &StoreHeader, soff: u64) -> &'m [u8] {
    if hdr.is_inplace() {
        // SAFETY: published inplace bodies are immutable; the slot is live.
        unsafe { map.bytes(soff + 8, hdr.rec_len as usize) }
    } else {
        let off = record::read_off(map, soff);
        if hdr.is_varlen() {
            record::chunk_body(map, off)
        } else {
            // SAFETY: published payloads are immutable.
            unsafe { map.bytes(off, hdr.rec_len as usize) }
        }
    }
}

// ============================================================================
//  Guards and record views
// ============================================================================

/// RAII epoch bracket; supports nesting within one worker.
struct EpochGuard<'a> {
    hdr: &'a StoreHeader,
    worker: usize,
    nest: &'a Cell<u32>,
}

impl Drop for EpochGuard<'_> {
    fn drop(&mut self) {
        let n = self.nest.get() - 1;
        self.nest.set(n);
        if n == 0 {
            generation::release(self.hdr, self.worker);
        }
    }
}

/// A looked-up bucket: the head of a key's collision chain.
///
/// Holding the handle keeps the worker's epoch published, which is what
/// keeps the bucket and its payloads alive against concurrent removes.
pub struct BucketRef<'w> {
    trie: &'w Htrie,
    bckt_off: u64,
    _guard: EpochGuard<'w>,
}

impl<'w> BucketRef<'w> {
    /// Region offset of the bucket (diagnostic).
    #[inline]
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.bckt_off
    }

    /// Linear scan for the next record with `key`, starting at `*cursor`.
    ///
    /// On a hit the cursor points at the matching slot; increment it before
    /// the next call to continue the collision chain.
    pub fn scan_for_rec(&self, key: u64, cursor: &mut usize) -> Option<RecordRef<'_>> {
        let map = &self.trie.map;
        let hdr = self.trie.hdr();
        let ssz = bucket::slot_size(hdr.rec_len, hdr.is_inplace());
        let cm = bucket::hdr(map, self.bckt_off).col_map.load(READ_ORD);

        while *cursor < BCKT_SLOTS_N {
            let s = *cursor;
            if cm & bucket::slot_mask(s) != 0 {
                let soff = bucket::slot_off(self.bckt_off, s, ssz);
                if record::read_key(map, soff) == key {
                    return Some(RecordRef {
                        trie: self.trie,
                        slot_off: soff,
                        key,
                    });
                }
            }
            *cursor += 1;
        }
        None
    }

    /// Iterate the collision chain of `key` within this bucket.
    pub fn records<'s>(&'s self, key: u64) -> impl Iterator<Item = RecordRef<'s>> + 's {
        let mut cursor = 0usize;
        std::iter::from_fn(move || {
            let rec = self.scan_for_rec(key, &mut cursor)?;
            cursor += 1;
            Some(rec)
        })
    }
}

/// A live record inside a looked-up bucket.
pub struct RecordRef<'b> {
    trie: &'b Htrie,
    slot_off: u64,
    key: u64,
}

impl<'b> RecordRef<'b> {
    #[inline]
    #[must_use]
    pub fn key(&self) -> u64 {
        self.key
    }

    /// Offset of the record body. Stable for the record's lifetime in
    /// indirect and variable-length stores.
    #[must_use]
    pub fn data_offset(&self) -> u64 {
        if self.trie.hdr().is_inplace() {
            self.slot_off
        } else {
            record::read_off(&self.trie.map, self.slot_off)
        }
    }

    /// The record body; for variable-length records, the first chunk.
    #[must_use]
    pub fn body(&self) -> &'b [u8] {
        record_body(&self.trie.map, self.trie.hdr(), self.slot_off)
    }

    /// Iterate the body chunk by chunk (one chunk for fixed-length stores).
    #[must_use]
    pub fn chunks(&self) -> ChunkIter<'b> {
        ChunkIter {
            trie: self.trie,
            off: self.data_offset(),
            inplace_slot: self.trie.hdr().is_inplace().then_some(self.slot_off),
        }
    }
}

/// Iterator over the chunks of a record body.
pub struct ChunkIter<'b> {
    trie: &'b Htrie,
    off: u64,
    inplace_slot: Option<u64>,
}

impl<'b> Iterator for ChunkIter<'b> {
    type Item = &'b [u8];

    fn next(&mut self) -> Option<&'b [u8]> {
        let map = &self.trie.map;
        let hdr = self.trie.hdr();

        if let Some(slot_off) = self.inplace_slot.take() {
            self.off = 0;
            // SAFETY: published inplace bodies are immutable.
            return Some(unsafe { map.bytes(slot_off + 8, hdr.rec_len as usize) });
        }
        if self.off == 0 {
            return None;
        }
        let off = self.off;
        if hdr.is_varlen() {
            self.off = record::chunk_next(map, off);
            Some(record::chunk_body(map, off))
        } else {
            self.off = 0;
            // SAFETY: published payloads are immutable.
            Some(unsafe { map.bytes(off, hdr.rec_len as usize) })
        }
    }
}

/// A stable reference to one stored chunk of a record.
///
/// [`Worker::insert`] hands back the record's head chunk;
/// [`Worker::extend_rec`] hands back the chunk it just appended. In
/// indirect and variable-length stores the offset addresses that chunk's
/// bytes and never changes while the record is live. For inplace stores
/// the handle is only a success indicator: the body moves when its bucket
/// bursts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordHandle {
    key: u64,
    off: u64,
    len: usize,
}

impl RecordHandle {
    #[inline]
    #[must_use]
    pub fn key(&self) -> u64 {
        self.key
    }

    /// Region offset of the chunk this handle describes: the head chunk
    /// for an `insert` handle, the appended chunk for an `extend_rec`
    /// handle.
    #[inline]
    #[must_use]
    pub fn data_offset(&self) -> u64 {
        self.off
    }

    /// Bytes stored in that chunk (a chunk may cap at a block).
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

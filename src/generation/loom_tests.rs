//! Loom model of the generation protocol.
//!
//! Loom explores the interleavings of a reduced model: one reader that
//! publishes an epoch, dereferences a shared slot and leaves; one writer
//! that unlinks the slot's target, synchronizes and frees it. The property
//! under test is the reclamation invariant: the reader never observes a
//! freed target through a published epoch.
//!
//! Run with: `RUSTFLAGS="--cfg loom" cargo test --lib generation::loom_tests`
//!
//! NOTE: Loom tests are expensive - they explore all interleavings.
//! Keep the number of operations small to avoid state explosion.

use loom::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use loom::sync::Arc;
use loom::thread;

const IDLE: u64 = u64::MAX;

/// Reduced store: a generation counter, two worker epochs, one trie edge
/// and a freed-flag per target.
struct Model {
    generation: AtomicU64,
    epochs: [AtomicU64; 2],
    /// The "index slot": 1 = linked target, 0 = unlinked.
    edge: AtomicUsize,
    /// Set when the writer reclaims the target.
    freed: AtomicUsize,
}

impl Model {
    fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
            epochs: [AtomicU64::new(IDLE), AtomicU64::new(IDLE)],
            edge: AtomicUsize::new(1),
            freed: AtomicUsize::new(0),
        }
    }

    fn observe(&self, w: usize) {
        let gen = self.generation.load(Ordering::SeqCst);
        self.epochs[w].store(gen, Ordering::SeqCst);
    }

    fn release(&self, w: usize) {
        self.epochs[w].store(IDLE, Ordering::SeqCst);
    }

    fn synchronize(&self, caller: usize) {
        let gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        loop {
            let mut lagging = false;
            for (i, e) in self.epochs.iter().enumerate() {
                if i != caller && e.load(Ordering::SeqCst) <= gen {
                    lagging = true;
                }
            }
            if !lagging {
                return;
            }
            thread::yield_now();
        }
    }
}

#[test]
fn reader_never_sees_a_freed_target() {
    loom::model(|| {
        let m = Arc::new(Model::new());

        let reader = {
            let m = Arc::clone(&m);
            thread::spawn(move || {
                m.observe(0);
                // Descend: load the edge, then dereference its target.
                if m.edge.load(Ordering::SeqCst) == 1 {
                    assert_eq!(
                        m.freed.load(Ordering::SeqCst),
                        0,
                        "dereferenced a reclaimed target under a published epoch"
                    );
                }
                m.release(0);
            })
        };

        let writer = {
            let m = Arc::clone(&m);
            thread::spawn(move || {
                // Writers publish no epoch of their own: unlink,
                // synchronize, reclaim.
                m.edge.store(0, Ordering::SeqCst);
                m.synchronize(1);
                m.freed.store(1, Ordering::SeqCst);
            })
        };

        reader.join().unwrap();
        writer.join().unwrap();
    });
}

#[test]
fn second_writer_waits_out_the_first_epoch() {
    loom::model(|| {
        let m = Arc::new(Model::new());

        // Worker 0 sits inside an operation started before the unlink.
        m.observe(0);

        let writer = {
            let m = Arc::clone(&m);
            thread::spawn(move || {
                m.edge.store(0, Ordering::SeqCst);
                m.synchronize(1);
                m.freed.store(1, Ordering::SeqCst);
            })
        };

        // The pre-existing reader finishes its critical section and leaves;
        // only then may the writer's synchronize return.
        assert_eq!(m.freed.load(Ordering::SeqCst), 0);
        m.release(0);

        writer.join().unwrap();
        assert_eq!(m.freed.load(Ordering::SeqCst), 1);
    });
}

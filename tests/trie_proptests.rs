//! Property-based tests for the trie engine.
//!
//! Differential testing against a `HashMap<u64, Vec<Vec<u8>>>` oracle: any
//! interleaving of inserts and removes must leave the trie holding exactly
//! the oracle's collision chains.

#![allow(clippy::unwrap_used)]

mod common;

use std::collections::HashMap;

use proptest::prelude::*;

use htrie::{Htrie, StoreConfig, Worker};

const MB: usize = 1 << 20;

// ============================================================================
//  Strategies
// ============================================================================

/// Small key universe so that duplicates and shared buckets are common.
fn small_key() -> impl Strategy<Value = u64> {
    prop_oneof![
        3 => (0u64..64),
        2 => (0u64..64).prop_map(common::mix_key),
        1 => any::<u64>(),
    ]
}

fn body() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..=48)
}

/// Operations for random testing.
#[derive(Debug, Clone)]
enum Op {
    Insert(u64, Vec<u8>),
    Remove(u64),
    Lookup(u64),
}

fn operations(max_ops: usize) -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            5 => (small_key(), body()).prop_map(|(k, b)| Op::Insert(k, b)),
            2 => small_key().prop_map(Op::Remove),
            2 => small_key().prop_map(Op::Lookup),
        ],
        0..=max_ops,
    )
}

// ============================================================================
//  Helpers
// ============================================================================

fn chain_of(w: &Worker<'_>, key: u64) -> Vec<Vec<u8>> {
    let mut chain: Vec<Vec<u8>> = w
        .lookup(key)
        .map(|b| b.records(key).map(|r| r.body().to_vec()).collect())
        .unwrap_or_default();
    chain.sort();
    chain
}

fn check_against_oracle(w: &Worker<'_>, oracle: &HashMap<u64, Vec<Vec<u8>>>) {
    for (&key, bodies) in oracle {
        let mut expected = bodies.clone();
        expected.sort();
        assert_eq!(
            chain_of(w, key),
            expected,
            "collision chain mismatch for key {key:#x}"
        );
    }
}

// ============================================================================
//  Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Every inserted record is found in the bucket of its key.
    #[test]
    fn insert_then_lookup(entries in prop::collection::vec((small_key(), body()), 1..200)) {
        let store = Htrie::open(StoreConfig::varlen(16 * MB)).unwrap();
        let w = store.worker().unwrap();
        let mut oracle: HashMap<u64, Vec<Vec<u8>>> = HashMap::new();

        for (key, data) in entries {
            w.insert(key, &data).unwrap();
            oracle.entry(key).or_default().push(data);
        }
        check_against_oracle(&w, &oracle);
    }

    /// `n` duplicates of one key form a chain of exactly `n` live records.
    #[test]
    fn duplicate_chain_count(key in any::<u64>(), n in 1usize..40) {
        let store = Htrie::open(StoreConfig::varlen(16 * MB)).unwrap();
        let w = store.worker().unwrap();

        for i in 0..n {
            w.insert(key, &[i as u8, 0xAA]).unwrap();
        }
        prop_assert_eq!(chain_of(&w, key).len(), n);
    }

    /// After `remove(k)`, a full sweep of `lookup(k)` yields nothing, and
    /// untouched keys keep their chains.
    #[test]
    fn remove_then_lookup(ops in operations(300)) {
        let store = Htrie::open(StoreConfig::varlen(16 * MB)).unwrap();
        let w = store.worker().unwrap();
        let mut oracle: HashMap<u64, Vec<Vec<u8>>> = HashMap::new();

        for op in ops {
            match op {
                Op::Insert(key, data) => {
                    w.insert(key, &data).unwrap();
                    oracle.entry(key).or_default().push(data);
                }
                Op::Remove(key) => {
                    w.remove(key);
                    oracle.remove(&key);
                }
                Op::Lookup(key) => {
                    let expected = oracle.get(&key).map_or(0, Vec::len);
                    prop_assert_eq!(chain_of(&w, key).len(), expected);
                }
            }
        }
        check_against_oracle(&w, &oracle);
    }

    /// Data offsets of indirect records never move under unrelated inserts
    /// and removes, including across bursts.
    #[test]
    fn pointer_stability(noise in prop::collection::vec((small_key(), body()), 1..150)) {
        let store = Htrie::open(StoreConfig::varlen(16 * MB)).unwrap();
        let w = store.worker().unwrap();

        let watched_key = 0xFEED_F00D_u64;
        let handle = w.insert(watched_key, b"watched record").unwrap();

        for (key, data) in noise {
            if key != watched_key {
                w.insert(key, &data).unwrap();
                if key % 3 == 0 {
                    w.remove(key);
                }
            }
        }

        let b = w.lookup(watched_key).unwrap();
        let rec = b.records(watched_key).next().unwrap();
        prop_assert_eq!(rec.data_offset(), handle.data_offset());
        prop_assert_eq!(rec.body(), b"watched record");
    }

    /// The walk visits exactly the records the oracle holds.
    #[test]
    fn walk_matches_population(entries in prop::collection::vec((small_key(), 1u32..1000), 1..150)) {
        let store = Htrie::open(StoreConfig::fixed(16 * MB, 4)).unwrap();
        let w = store.worker().unwrap();

        let mut expected_sum: u64 = 0;
        for &(key, v) in &entries {
            w.insert(key, &v.to_le_bytes()).unwrap();
            expected_sum += u64::from(v);
        }

        let mut sum = 0u64;
        let mut count = 0usize;
        w.walk::<(), _>(|body| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(body);
            sum += u64::from(u32::from_le_bytes(buf));
            count += 1;
            Ok(())
        }).unwrap();

        prop_assert_eq!(count, entries.len());
        prop_assert_eq!(sum, expected_sum);
    }
}

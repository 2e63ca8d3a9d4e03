/// Property and fuzz tests for B+Tree structural invariants.
///
/// Runs randomized insert/remove workloads against a `BTreeMap` reference
/// and verifies, after every workload (and periodically during heavy
/// deletes):
/// - Per-page key order and fill bounds
/// - Separator keys equal the largest key of their subtree
/// - The sentinel sits exactly on the rightmost page of each level
/// - Leaf previous/next pointers are mutual inverses, ordered by key
/// - Forward and backward cursors visit exactly the live entries
use std::collections::BTreeMap;

use kuradb::{BPage, BTree, Datum, MemStore, Recid, TreeOptions};

/// Simple deterministic PRNG (xorshift64) for reproducible tests without
/// requiring the rand crate in test scope.
struct Rng(u64);

impl Rng {
    fn new(seed: u64) -> Self {
        Self(seed)
    }
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }
    fn next_range(&mut self, max: u64) -> u64 {
        self.next() % max
    }
}

fn new_tree(capacity: usize) -> (BTree, MemStore) {
    let mut store = MemStore::new();
    let tree = BTree::create(&mut store, TreeOptions::new().capacity(capacity)).unwrap();
    (tree, store)
}

// ── Invariant checkers ──

/// Recursively verify page-level invariants and collect the leaves in key
/// order for the linked-list checks.
fn verify_page(
    tree: &BTree,
    store: &mut MemStore,
    recid: Recid,
    height: u32,
    rightmost: bool,
    leaves: &mut Vec<BPage>,
) {
    let page = tree.fetch_page(store, recid).unwrap();
    let capacity = page.capacity();
    let half = capacity / 2;

    if recid != tree.root_recid() {
        assert!(
            page.fill() >= half - 1,
            "page {} under-full: fill {} < {}",
            recid,
            page.fill(),
            half - 1
        );
    }

    for i in page.first..capacity {
        match &page.keys[i] {
            None => assert!(
                rightmost && i == capacity - 1,
                "page {}: absent key outside the rightmost sentinel slot (slot {})",
                recid,
                i
            ),
            Some(key) => {
                if i > page.first {
                    let prev = page.keys[i - 1]
                        .as_ref()
                        .expect("live slot below a real key holds no key");
                    assert!(
                        prev < key,
                        "page {}: keys not strictly ascending at slots {}/{}",
                        recid,
                        i - 1,
                        i
                    );
                }
            }
        }
    }

    if height == 1 {
        assert!(page.is_leaf, "page {} at leaf level is not a leaf", recid);
        leaves.push(page);
        return;
    }
    assert!(!page.is_leaf, "page {} above leaf level is a leaf", recid);

    for i in page.first..capacity {
        let child_recid = page.children[i];
        let child = tree.fetch_page(store, child_recid).unwrap();
        assert_eq!(
            page.keys[i],
            child.keys[capacity - 1],
            "page {}: separator at slot {} does not match child {} largest key",
            recid,
            i,
            child_recid
        );
        verify_page(
            tree,
            store,
            child_recid,
            height - 1,
            rightmost && i == capacity - 1,
            leaves,
        );
    }
}

/// Walk the tree and check every structural invariant plus the leaf list.
fn assert_tree_invariants(tree: &BTree, store: &mut MemStore) {
    if tree.root_recid() == 0 {
        assert_eq!(tree.len(), 0);
        return;
    }
    let mut leaves = Vec::new();
    verify_page(tree, store, tree.root_recid(), tree.height(), true, &mut leaves);

    assert_eq!(leaves.first().unwrap().previous, 0, "leftmost leaf has a previous link");
    assert_eq!(leaves.last().unwrap().next, 0, "rightmost leaf has a next link");
    for pair in leaves.windows(2) {
        assert_eq!(
            pair[0].next, pair[1].recid,
            "leaf {} next link broken",
            pair[0].recid
        );
        assert_eq!(
            pair[1].previous, pair[0].recid,
            "leaf {} previous link broken",
            pair[1].recid
        );
    }
}

/// Forward iteration must yield exactly the reference entries in order,
/// backward iteration the same entries reversed.
fn assert_matches_reference(tree: &BTree, store: &mut MemStore, expected: &BTreeMap<i32, i32>) {
    assert_eq!(tree.len(), expected.len() as u64);

    let mut forward = Vec::new();
    if let Some(mut cursor) = tree.find_first(store).unwrap() {
        while let Some((key, value)) = cursor.next(tree, store).unwrap() {
            forward.push((key, value));
        }
    }
    let reference: Vec<(Datum, Datum)> = expected
        .iter()
        .map(|(&k, &v)| (Datum::Int(k), Datum::Int(v)))
        .collect();
    assert_eq!(forward, reference, "forward iteration diverges from reference");

    let mut backward = Vec::new();
    if let Some(mut cursor) = tree.find(store, &Datum::Int(i32::MAX)).unwrap() {
        while let Some((key, value)) = cursor.previous(tree, store).unwrap() {
            backward.push((key, value));
        }
    }
    backward.reverse();
    assert_eq!(backward, reference, "backward iteration diverges from reference");

    for (&k, &v) in expected {
        assert_eq!(
            tree.find_value(store, &Datum::Int(k)).unwrap(),
            Some(Datum::Int(v)),
            "key {} unreachable",
            k
        );
    }
}

// ── Property tests ──

/// Random insert-only workload.
#[test]
fn test_property_random_inserts() {
    let (mut tree, mut store) = new_tree(4);
    let mut rng = Rng::new(12345);
    let mut expected = BTreeMap::new();

    for _ in 0..500 {
        let k = rng.next_range(10_000) as i32;
        tree.insert(&mut store, Datum::Int(k), Datum::Int(k * 2), true)
            .unwrap();
        expected.insert(k, k * 2);
    }

    assert_tree_invariants(&tree, &mut store);
    assert_matches_reference(&tree, &mut store, &expected);
}

/// Random mixed insert/remove workload over a small key space.
#[test]
fn test_property_random_insert_remove() {
    let (mut tree, mut store) = new_tree(4);
    let mut rng = Rng::new(67890);
    let mut expected = BTreeMap::new();

    for step in 0..1000 {
        let op = rng.next_range(3);
        let k = rng.next_range(200) as i32;
        let v = step as i32;

        if op < 2 {
            tree.insert(&mut store, Datum::Int(k), Datum::Int(v), true)
                .unwrap();
            expected.insert(k, v);
        } else {
            let removed = tree.remove(&mut store, &Datum::Int(k)).unwrap();
            match expected.remove(&k) {
                Some(old) => assert_eq!(removed, Some(Datum::Int(old))),
                None => assert_eq!(removed, None, "remove invented key {}", k),
            }
        }
    }

    assert_tree_invariants(&tree, &mut store);
    assert_matches_reference(&tree, &mut store, &expected);
}

/// Insert many, then delete most in shuffled order, checking invariants
/// periodically along the way.
#[test]
fn test_property_heavy_remove() {
    let (mut tree, mut store) = new_tree(4);
    let mut expected = BTreeMap::new();

    for i in 0..300i32 {
        tree.insert(&mut store, Datum::Int(i), Datum::Int(i), false)
            .unwrap();
        expected.insert(i, i);
    }
    assert_tree_invariants(&tree, &mut store);

    let mut rng = Rng::new(11111);
    let mut to_remove: Vec<i32> = (0..300).collect();
    // Fisher-Yates shuffle
    for i in (1..to_remove.len()).rev() {
        let j = rng.next_range((i + 1) as u64) as usize;
        to_remove.swap(i, j);
    }

    for (round, &k) in to_remove.iter().take(280).enumerate() {
        let removed = tree.remove(&mut store, &Datum::Int(k)).unwrap();
        assert_eq!(removed, Some(Datum::Int(k)), "key {} missing at removal", k);
        expected.remove(&k);

        if (round + 1) % 50 == 0 {
            assert_tree_invariants(&tree, &mut store);
            assert_matches_reference(&tree, &mut store, &expected);
        }
    }

    assert_tree_invariants(&tree, &mut store);
    assert_matches_reference(&tree, &mut store, &expected);
    assert_eq!(expected.len(), 20);
}

/// Multiple seeds and both small capacities to increase coverage.
#[test]
fn test_property_multiple_seeds() {
    for capacity in [4, 8] {
        for seed in [99u64, 777, 42424, 1337, 0xDEAD] {
            let (mut tree, mut store) = new_tree(capacity);
            let mut rng = Rng::new(seed);
            let mut expected = BTreeMap::new();

            for _ in 0..400 {
                let op = rng.next_range(4);
                let k = rng.next_range(100) as i32;

                if op < 3 {
                    tree.insert(&mut store, Datum::Int(k), Datum::Int(k), true)
                        .unwrap();
                    expected.insert(k, k);
                } else {
                    tree.remove(&mut store, &Datum::Int(k)).unwrap();
                    expected.remove(&k);
                }
            }

            assert_tree_invariants(&tree, &mut store);
            assert_matches_reference(&tree, &mut store, &expected);
        }
    }
}

/// Remove every key one-by-one and verify the tree stays valid at each
/// step, ending in a legal empty root leaf.
#[test]
fn test_property_remove_to_empty() {
    let (mut tree, mut store) = new_tree(4);
    let mut expected = BTreeMap::new();

    for i in 0..50i32 {
        tree.insert(&mut store, Datum::Int(i), Datum::Int(i), false)
            .unwrap();
        expected.insert(i, i);
    }

    for i in 0..50i32 {
        assert!(tree.remove(&mut store, &Datum::Int(i)).unwrap().is_some());
        expected.remove(&i);
        assert_tree_invariants(&tree, &mut store);
        assert_matches_reference(&tree, &mut store, &expected);
    }

    assert_eq!(tree.len(), 0);
    assert_eq!(tree.height(), 1);
    let root = tree.fetch_page(&mut store, tree.root_recid()).unwrap();
    assert!(root.is_leaf && root.is_empty());
}

/// Reverse-order insertion (every insert lands on the leftmost leaf).
#[test]
fn test_property_reverse_insert_order() {
    let (mut tree, mut store) = new_tree(4);
    let mut expected = BTreeMap::new();

    for i in (0..200i32).rev() {
        tree.insert(&mut store, Datum::Int(i), Datum::Int(-i), false)
            .unwrap();
        expected.insert(i, -i);
    }
    assert_tree_invariants(&tree, &mut store);

    for i in (0..200i32).step_by(3) {
        tree.remove(&mut store, &Datum::Int(i)).unwrap();
        expected.remove(&i);
    }

    assert_tree_invariants(&tree, &mut store);
    assert_matches_reference(&tree, &mut store, &expected);
}

/// Inserting with replace twice leaves the tree observationally identical
/// to inserting once.
#[test]
fn test_property_replace_idempotent() {
    let (mut tree_once, mut store_once) = new_tree(4);
    let (mut tree_twice, mut store_twice) = new_tree(4);
    let mut rng = Rng::new(55555);

    for _ in 0..200 {
        let k = rng.next_range(40) as i32;
        let v = rng.next_range(1000) as i32;
        tree_once
            .insert(&mut store_once, Datum::Int(k), Datum::Int(v), true)
            .unwrap();
        for _ in 0..2 {
            tree_twice
                .insert(&mut store_twice, Datum::Int(k), Datum::Int(v), true)
                .unwrap();
        }
    }

    assert_eq!(tree_once.len(), tree_twice.len());
    let mut once = Vec::new();
    let mut cursor = tree_once.find_first(&mut store_once).unwrap().unwrap();
    while let Some(entry) = cursor.next(&tree_once, &mut store_once).unwrap() {
        once.push(entry);
    }
    let mut twice = Vec::new();
    let mut cursor = tree_twice.find_first(&mut store_twice).unwrap().unwrap();
    while let Some(entry) = cursor.next(&tree_twice, &mut store_twice).unwrap() {
        twice.push(entry);
    }
    assert_eq!(once, twice);

    assert_tree_invariants(&tree_once, &mut store_once);
    assert_tree_invariants(&tree_twice, &mut store_twice);
}

/// String keys exercise the prefix-shared key form end to end.
#[test]
fn test_property_string_keys() {
    let (mut tree, mut store) = new_tree(8);
    let mut rng = Rng::new(2024);
    let mut expected: BTreeMap<String, i32> = BTreeMap::new();

    for step in 0..400 {
        let k = format!("user:{:05}", rng.next_range(500));
        let v = step as i32;
        if rng.next_range(4) < 3 {
            tree.insert(&mut store, Datum::Str(k.clone()), Datum::Int(v), true)
                .unwrap();
            expected.insert(k, v);
        } else {
            let removed = tree.remove(&mut store, &Datum::Str(k.clone())).unwrap();
            match expected.remove(&k) {
                Some(old) => assert_eq!(removed, Some(Datum::Int(old))),
                None => assert_eq!(removed, None),
            }
        }
    }

    assert_tree_invariants(&tree, &mut store);
    assert_eq!(tree.len(), expected.len() as u64);
    let mut forward = Vec::new();
    if let Some(mut cursor) = tree.find_first(&mut store).unwrap() {
        while let Some((key, value)) = cursor.next(&tree, &mut store).unwrap() {
            forward.push((key, value));
        }
    }
    let reference: Vec<(Datum, Datum)> = expected
        .iter()
        .map(|(k, &v)| (Datum::Str(k.clone()), Datum::Int(v)))
        .collect();
    assert_eq!(forward, reference);
}

/// The tree must survive a header reload mid-workload: everything it needs
/// is persisted through the record store.
#[test]
fn test_property_reload_mid_workload() {
    let (mut tree, mut store) = new_tree(4);
    let mut expected = BTreeMap::new();
    let mut rng = Rng::new(31337);

    for round in 0..4 {
        for _ in 0..100 {
            let k = rng.next_range(300) as i32;
            if rng.next_range(3) < 2 {
                tree.insert(&mut store, Datum::Int(k), Datum::Int(k + round), true)
                    .unwrap();
                expected.insert(k, k + round);
            } else {
                tree.remove(&mut store, &Datum::Int(k)).unwrap();
                expected.remove(&k);
            }
        }
        // drop the handle and reload from the persisted header
        let header = tree.header_recid();
        tree = BTree::load(&mut store, header, TreeOptions::new()).unwrap();

        assert_tree_invariants(&tree, &mut store);
        assert_matches_reference(&tree, &mut store, &expected);
    }
}

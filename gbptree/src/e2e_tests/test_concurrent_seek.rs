//! Test that range scans running beside writers see every key that stays in
//! the tree, once and in order.

use crate::e2e_tests::helpers::{PAGE_SIZE, TREE_PATH, TestStore};
use crate::tree::{GBPTree, HeaderUpdate, SimpleLongLayout};

const KEY_SPACE: u64 = 2000;
const WRITERS: u64 = 2;
const READERS: usize = 4;
const SCANS_PER_READER: usize = 10;

/// Readers retry a lot while writers publish back to back.
fn open_tree(store: &TestStore) -> GBPTree<SimpleLongLayout> {
    GBPTree::builder(&store.page_cache, TREE_PATH, SimpleLongLayout)
        .page_size(PAGE_SIZE)
        .seek_max_retries(100_000)
        .build()
        .expect("Failed to open tree")
}

#[test]
fn test_seek_under_concurrent_inserts() {
    let store = TestStore::new();
    let tree = open_tree(&store);

    // Even keys are in place before any scan starts and are never removed.
    let stable_keys: Vec<u64> = (0..KEY_SPACE).step_by(2).collect();
    for key in &stable_keys {
        tree.insert(key, key).expect("Failed to insert");
    }
    tree.checkpoint(HeaderUpdate::CarryOver)
        .expect("Failed to checkpoint");

    std::thread::scope(|scope| {
        let span = KEY_SPACE / WRITERS;
        for writer in 0..WRITERS {
            let tree = &tree;
            scope.spawn(move || {
                for key in (writer * span..(writer + 1) * span).filter(|key| key % 2 == 1) {
                    tree.insert(&key, &key).expect("Failed to insert");
                }
            });
        }
        for _ in 0..READERS {
            let tree = &tree;
            let stable_keys = &stable_keys;
            scope.spawn(move || {
                for _ in 0..SCANS_PER_READER {
                    let seen: Vec<u64> = tree
                        .seek_all()
                        .expect("Failed to seek")
                        .map(|entry| entry.expect("Failed to read entry").0)
                        .collect();
                    assert!(
                        seen.windows(2).all(|pair| pair[0] < pair[1]),
                        "scan returned keys out of order or twice"
                    );
                    let even: Vec<u64> = seen.iter().copied().filter(|key| key % 2 == 0).collect();
                    assert_eq!(&even, stable_keys);
                }
            });
        }
    });

    assert_eq!(tree.count_entries().expect("Failed to count"), KEY_SPACE);
    let report = tree.check_consistency().expect("Failed to check");
    assert!(report.is_consistent(), "{:?}", report.violations);
    tree.close().expect("Failed to close");
}

#[test]
fn test_bounded_seek_under_concurrent_inserts_outside_range() {
    let store = TestStore::new();
    let tree = open_tree(&store);
    for key in 0..500u64 {
        tree.insert(&key, &key).expect("Failed to insert");
    }

    std::thread::scope(|scope| {
        let writer_tree = &tree;
        scope.spawn(move || {
            for key in 1000..1500u64 {
                writer_tree.insert(&key, &key).expect("Failed to insert");
            }
        });
        let reader_tree = &tree;
        scope.spawn(move || {
            for _ in 0..SCANS_PER_READER {
                let seen: Vec<u64> = reader_tree
                    .seek(&100, &400)
                    .expect("Failed to seek")
                    .map(|entry| entry.expect("Failed to read entry").0)
                    .collect();
                assert_eq!(seen, (100..400).collect::<Vec<_>>());
            }
        });
    });
    tree.close().expect("Failed to close");
}

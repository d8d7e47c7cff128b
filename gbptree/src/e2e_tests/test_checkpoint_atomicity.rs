//! Test that a crash leaves a tree exactly as of its last completed
//! checkpoint, including crashes in the middle of a checkpoint.

use crate::e2e_tests::helpers::{TestStore, bootstrapped_keys, insert_range, keys};
use crate::failpoint;
use crate::tree::{GBPTree, GBPTreeError, HeaderUpdate, SimpleLongLayout};

/// Checkpoint keys 0..50, then insert 50..200 without a checkpoint.
fn store_with_pending_writes() -> (TestStore, GBPTree<SimpleLongLayout>) {
    let store = TestStore::new();
    let tree = store.open_tree();
    insert_range(&tree, 0..50);
    tree.checkpoint(HeaderUpdate::CarryOver)
        .expect("Failed to checkpoint");
    insert_range(&tree, 50..200);
    (store, tree)
}

fn keys_after_crash(store: &TestStore) -> Vec<u64> {
    store.crash();
    let bootstrap = store.bootstrap();
    let tree = bootstrap
        .tree()
        .unwrap_or_else(|e| panic!("bootstrap failed: {e}"));
    let found = bootstrapped_keys(tree);
    assert!(tree.check_consistency().expect("Failed to check").is_consistent());
    bootstrap.close().expect("Failed to close");
    found
}

fn checkpoint_failing_at(tree: &GBPTree<SimpleLongLayout>, point: &str) -> Result<(), GBPTreeError> {
    failpoint::enable(point);
    let result = tree.checkpoint(HeaderUpdate::CarryOver);
    failpoint::disable(point);
    result
}

#[test]
fn test_crash_without_checkpoint_keeps_previous_state() {
    let (store, tree) = store_with_pending_writes();
    drop(tree);
    assert_eq!(keys_after_crash(&store), (0..50).collect::<Vec<_>>());
}

#[test]
fn test_crash_after_checkpoint_keeps_new_state() {
    let (store, tree) = store_with_pending_writes();
    tree.checkpoint(HeaderUpdate::CarryOver)
        .expect("Failed to checkpoint");
    drop(tree);
    assert_eq!(keys_after_crash(&store), (0..200).collect::<Vec<_>>());
}

#[test]
fn test_crash_before_state_write_keeps_previous_state() {
    let (store, tree) = store_with_pending_writes();
    let result = checkpoint_failing_at(&tree, failpoint::CHECKPOINT_BEFORE_STATE_WRITE);
    assert!(matches!(result, Err(GBPTreeError::Io(_))), "{result:?}");
    drop(tree);
    assert_eq!(keys_after_crash(&store), (0..50).collect::<Vec<_>>());
}

#[test]
fn test_crash_before_state_sync_keeps_previous_state() {
    let (store, tree) = store_with_pending_writes();
    let result = checkpoint_failing_at(&tree, failpoint::CHECKPOINT_BEFORE_STATE_SYNC);
    assert!(matches!(result, Err(GBPTreeError::Io(_))), "{result:?}");
    drop(tree);
    assert_eq!(keys_after_crash(&store), (0..50).collect::<Vec<_>>());
}

#[test]
fn test_reopen_after_crash_accepts_new_writes() {
    let (store, tree) = store_with_pending_writes();
    drop(tree);
    store.crash();

    let tree = store.open_tree();
    assert!(!tree.cleanup_pending());
    insert_range(&tree, 50..60);
    tree.close().expect("Failed to close");

    let tree = store.open_tree();
    assert_eq!(keys(&tree), (0..60).collect::<Vec<_>>());
    tree.close().expect("Failed to close");
}

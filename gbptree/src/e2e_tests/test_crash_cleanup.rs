//! Test that pointers written by a crashed session are cleaned before the
//! tree checkpoints again, whichever collector runs the cleanup.

use std::sync::Arc;

use crate::collector::{GroupingCleanupCollector, IgnoreCleanupCollector, RecoveryCleanupWorkCollector};
use crate::e2e_tests::helpers::{TestStore, insert_range, keys};
use crate::failpoint;
use crate::scheduler::TokioJobScheduler;
use crate::tree::{CleanupReport, GBPTreeError, HeaderUpdate};

/// Leave pages of a crashed generation on disk: keys 0..100 checkpointed,
/// keys 100..300 flushed by a checkpoint that never wrote its state.
fn crashed_store() -> TestStore {
    let store = TestStore::new();
    let tree = store.open_tree();
    insert_range(&tree, 0..100);
    tree.checkpoint(HeaderUpdate::CarryOver)
        .expect("Failed to checkpoint");
    insert_range(&tree, 100..300);

    failpoint::enable(failpoint::CHECKPOINT_BEFORE_STATE_WRITE);
    let result = tree.checkpoint(HeaderUpdate::CarryOver);
    failpoint::disable(failpoint::CHECKPOINT_BEFORE_STATE_WRITE);
    assert!(result.is_err());

    drop(tree);
    store.crash();
    store
}

#[test]
fn test_cleanup_clears_crashed_pointers() {
    let store = crashed_store();
    let tree = store.open_tree_with(Arc::new(IgnoreCleanupCollector));
    assert!(tree.cleanup_pending());
    assert_eq!(keys(&tree), (0..100).collect::<Vec<_>>());
    assert!(matches!(
        tree.checkpoint(HeaderUpdate::CarryOver),
        Err(GBPTreeError::CleanupPending)
    ));

    let report = tree.clean_crashed().expect("Failed to clean");
    assert!(report.pointers_cleaned > 0, "{report:?}");
    assert!(report.reclaimed_tail_pages > 0, "{report:?}");
    assert!(!tree.cleanup_pending());
    assert_eq!(
        tree.clean_crashed().expect("Failed to clean"),
        CleanupReport::default()
    );

    let consistency = tree.check_consistency().expect("Failed to check");
    assert!(consistency.is_consistent(), "{:?}", consistency.violations);
    tree.checkpoint(HeaderUpdate::CarryOver)
        .expect("Failed to checkpoint");
    tree.close().expect("Failed to close");
}

#[test]
fn test_grouping_collector_runs_cleanup_in_background() {
    let store = crashed_store();
    let collector = Arc::new(GroupingCleanupCollector::new());
    let tree = store.open_tree_with(Arc::clone(&collector) as Arc<dyn RecoveryCleanupWorkCollector>);
    assert!(tree.cleanup_pending());
    assert_eq!(collector.pending(), 1);

    let runtime = tokio::runtime::Runtime::new().expect("Failed to create runtime");
    let scheduler = TokioJobScheduler::new(runtime.handle().clone());
    collector
        .start(&scheduler)
        .wait()
        .expect("Cleanup job failed");
    assert_eq!(collector.pending(), 0);
    assert!(!tree.cleanup_pending());

    insert_range(&tree, 100..150);
    tree.close().expect("Failed to close");

    let tree = store.open_tree();
    assert_eq!(keys(&tree), (0..150).collect::<Vec<_>>());
    let consistency = tree.check_consistency().expect("Failed to check");
    assert!(consistency.is_consistent(), "{:?}", consistency.violations);
    tree.close().expect("Failed to close");
}

#[test]
fn test_tree_closed_before_cleanup_needs_none() {
    let store = crashed_store();
    let collector = Arc::new(GroupingCleanupCollector::new());
    let tree = store.open_tree_with(Arc::clone(&collector) as Arc<dyn RecoveryCleanupWorkCollector>);
    tree.close().expect("Failed to close");

    collector.run_all().expect("Failed to run cleanup");
    assert_eq!(collector.pending(), 0);

    // Still crashed: the next open cleans up.
    let tree = store.open_tree();
    assert!(!tree.cleanup_pending());
    assert_eq!(keys(&tree), (0..100).collect::<Vec<_>>());
    tree.close().expect("Failed to close");
}

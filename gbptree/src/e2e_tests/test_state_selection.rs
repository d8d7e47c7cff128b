//! Test that opening a tree file picks the newest valid of its two states.

use crate::e2e_tests::helpers::{PAGE_SIZE, TestStore, insert_range};
use crate::page_cache::MapOptions;
use crate::tree::{
    CollectingVisitor, GBPTreeError, HeaderUpdate, StateSlot, TreeInconsistency, TreeStateRecord,
    visit_header,
};

/// Offset of a byte inside a state record's checksummed fields.
const STATE_FIELD_OFFSET: u64 = 20;

fn read_header(store: &TestStore) -> (CollectingVisitor, Result<TreeStateRecord, GBPTreeError>) {
    let paged_file = store
        .page_cache
        .map(store.tree_path(), PAGE_SIZE, MapOptions::read_only())
        .expect("Failed to map tree");
    let mut visitor = CollectingVisitor::default();
    let selected = visit_header(&paged_file, &mut visitor).map(|(_, state)| state);
    paged_file.close();
    (visitor, selected)
}

fn corrupt_slot(store: &TestStore, slot: StateSlot) {
    store
        .fs
        .corrupt_byte(store.tree_path(), slot.page_id() * PAGE_SIZE as u64 + STATE_FIELD_OFFSET)
        .expect("Failed to corrupt state");
}

fn checkpointed_store() -> TestStore {
    let store = TestStore::new();
    let tree = store.open_tree();
    insert_range(&tree, 0..40);
    tree.checkpoint(HeaderUpdate::Replace(b"first"))
        .expect("Failed to checkpoint");
    insert_range(&tree, 40..80);
    tree.checkpoint(HeaderUpdate::Replace(b"second"))
        .expect("Failed to checkpoint");
    drop(tree);
    store
}

#[test]
fn test_newest_state_is_selected() {
    let store = checkpointed_store();
    let (visitor, selected) = read_header(&store);
    let selected = selected.expect("Failed to select state");

    assert_eq!(visitor.states.len(), 2);
    let stamps: Vec<(u64, u64)> = visitor
        .states
        .iter()
        .map(|(_, state)| state.as_ref().expect("Both states are valid").state.stamp())
        .collect();
    assert_ne!(stamps[0], stamps[1]);
    assert_eq!(selected.state.stamp(), stamps[0].max(stamps[1]));
    assert_eq!(selected.header, b"second");
    assert_eq!(visitor.header_data.as_deref(), Some(b"second".as_slice()));
}

#[test]
fn test_only_valid_state_is_selected_whatever_its_stamp() {
    let store = checkpointed_store();
    let (_, newest) = read_header(&store);
    let newest = newest.expect("Failed to select state");

    corrupt_slot(&store, newest.state.slot);
    let (visitor, selected) = read_header(&store);
    let selected = selected.expect("Failed to select state");

    assert_eq!(selected.state.slot, newest.state.slot.other());
    assert!(selected.state.stamp() < newest.state.stamp());
    assert_eq!(selected.header, b"first");
    assert!(
        visitor
            .states
            .iter()
            .any(|(slot, state)| *slot == newest.state.slot && state.is_err())
    );
}

#[test]
fn test_both_states_invalid_is_an_inconsistency() {
    let store = checkpointed_store();
    corrupt_slot(&store, StateSlot::A);
    corrupt_slot(&store, StateSlot::B);

    let (_, selected) = read_header(&store);
    assert!(matches!(
        selected,
        Err(GBPTreeError::TreeInconsistency(
            TreeInconsistency::BothStatesInvalid { .. }
        ))
    ));

    let bootstrap = store.bootstrap();
    assert!(!bootstrap.is_tree());
}

//! Test recovery of a tree from its last checkpoint plus the transaction
//! log, and appending to the log after recovery.

use std::path::Path;

use crate::e2e_tests::helpers::{LOG_PATH, TestStore, keys, read_until_error};
use crate::fs::OpenMode;
use crate::tree::{GBPTree, HeaderUpdate, SimpleLongLayout};
use crate::wal::{
    LogEntry, LogEntryVersion, LogEntryWriter, PhysicalLogChannel, ReadableChannel, TransactionAppender,
    TreeCommand, VersionAwareLogEntryReader, replay,
};

const LOG_SIZE: u64 = 64 * 1024;

/// Log a transaction, then apply it to the tree.
fn commit(
    log: &mut TransactionAppender<PhysicalLogChannel>,
    tree: &GBPTree<SimpleLongLayout>,
    commands: &[TreeCommand],
) {
    let payloads: Vec<Vec<u8>> = commands.iter().map(TreeCommand::encode).collect();
    log.append(&payloads).expect("Failed to append");
    for command in commands {
        command.apply(tree).expect("Failed to apply");
    }
}

fn inserts(keys: std::ops::Range<u64>) -> Vec<TreeCommand> {
    keys.map(|key| TreeCommand::insert(&SimpleLongLayout, &key, &(key * 10)))
        .collect()
}

fn open_log(store: &TestStore) -> PhysicalLogChannel {
    PhysicalLogChannel::open(store.fs.as_ref(), Path::new(LOG_PATH), OpenMode::ReadWrite)
        .expect("Failed to open log")
}

#[test]
fn test_replay_restores_committed_transactions_after_crash() {
    let store = TestStore::new();
    let channel = PhysicalLogChannel::create(store.fs.as_ref(), Path::new(LOG_PATH), LOG_SIZE)
        .expect("Failed to create log");
    let mut log = TransactionAppender::new(LogEntryWriter::new(channel, LogEntryVersion::V2));
    let tree = store.open_tree();

    for batch in 0..5 {
        commit(&mut log, &tree, &inserts(batch * 10..batch * 10 + 10));
    }
    tree.checkpoint(HeaderUpdate::CarryOver)
        .expect("Failed to checkpoint");
    log.check_point("tree checkpoint")
        .expect("Failed to write checkpoint");
    for batch in 5..10 {
        commit(&mut log, &tree, &inserts(batch * 10..batch * 10 + 10));
    }
    let removals: Vec<TreeCommand> = (0..5)
        .map(|key| TreeCommand::remove(&SimpleLongLayout, &key))
        .collect();
    commit(&mut log, &tree, &removals);
    drop(log);
    drop(tree);
    store.crash();

    let tree = store.open_tree();
    assert_eq!(keys(&tree), (0..50).collect::<Vec<_>>());

    let mut reader = VersionAwareLogEntryReader::new(open_log(&store)).verify_checksum_chain(true);
    let report = replay(&mut reader, &tree).expect("Failed to replay");
    assert_eq!(report.checkpointed_tx_id, Some(5));
    assert_eq!(report.transactions_replayed, 6);
    assert_eq!(report.commands_applied, 55);
    assert_eq!(report.last_tx_id, Some(11));
    assert!(!report.incomplete_tail);
    assert_eq!(keys(&tree), (5..100).collect::<Vec<_>>());

    // Append where the log ends, continuing the checksum chain.
    let mut channel = reader.into_channel();
    ReadableChannel::set_position(&mut channel, report.end_position)
        .expect("Failed to position log");
    let mut log = TransactionAppender::resume(
        LogEntryWriter::new(channel, LogEntryVersion::V2),
        report.last_tx_id.expect("Log has transactions"),
        report.last_checksum.expect("Log has transactions"),
    );
    commit(&mut log, &tree, &inserts(1000..1001));
    drop(log);
    tree.close().expect("Failed to close");

    let mut reader = VersionAwareLogEntryReader::new(open_log(&store)).verify_checksum_chain(true);
    let (entries, error) = read_until_error(&mut reader);
    assert!(error.is_none(), "unexpected error: {error:?}");
    let commits = entries
        .iter()
        .filter(|entry| matches!(entry, LogEntry::Commit(_)))
        .count();
    assert_eq!(commits, 12);

    let tree = store.open_tree();
    assert_eq!(tree.get(&1000).expect("Failed to get"), Some(10_000));
    assert_eq!(tree.count_entries().expect("Failed to count"), 96);
    tree.close().expect("Failed to close");
}

#[test]
fn test_replay_of_log_without_checkpoint_applies_everything() {
    let store = TestStore::new();
    let channel = PhysicalLogChannel::create(store.fs.as_ref(), Path::new(LOG_PATH), LOG_SIZE)
        .expect("Failed to create log");
    let mut log = TransactionAppender::new(LogEntryWriter::new(channel, LogEntryVersion::V1));
    let tree = store.open_tree();
    commit(&mut log, &tree, &inserts(0..20));
    log.writer_mut().set_version(LogEntryVersion::V2);
    commit(&mut log, &tree, &inserts(20..40));
    drop(log);
    drop(tree);
    store.crash();

    let tree = store.open_tree();
    assert!(keys(&tree).is_empty());
    let mut reader = VersionAwareLogEntryReader::new(open_log(&store)).verify_checksum_chain(true);
    let report = replay(&mut reader, &tree).expect("Failed to replay");
    assert_eq!(report.checkpointed_tx_id, None);
    assert_eq!(report.transactions_replayed, 2);
    assert_eq!(keys(&tree), (0..40).collect::<Vec<_>>());
    tree.close().expect("Failed to close");
}

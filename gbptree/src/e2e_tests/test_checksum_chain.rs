//! Test that tampering with a transaction is detected: a flipped commit
//! checksum breaks the chain into the next transaction when chain
//! verification is on, and flipped content no longer matches its checksum.

use crate::e2e_tests::helpers::{TestStore, keys, memory_log, read_until_error};
use crate::tree::SimpleLongLayout;
use crate::wal::{
    InMemoryChannel, LogEntry, LogEntryError, LogEntryVersion, TreeCommand,
    VersionAwareLogEntryReader, replay,
};

const CHECKSUM_LEN: usize = 4;

/// Two single-command transactions, with byte `index` of the first
/// commit's checksum flipped. Returns the bytes, the end of the first
/// transaction and its original checksum.
fn tampered_log(index: usize) -> (Vec<u8>, u64, u32) {
    let mut log = memory_log();
    log.append(&[b"one"]).expect("Failed to append");
    let first_checksum = log.last_checksum();
    let first_end = log.writer_mut().channel_mut().as_bytes().len();
    log.append(&[b"two"]).expect("Failed to append");

    let mut bytes = log.into_writer().into_channel().into_bytes();
    bytes[first_end - CHECKSUM_LEN + index] ^= 0xFF;
    (bytes, first_end as u64, first_checksum)
}

/// The checksum with byte `index` (big-endian) flipped.
fn flipped(checksum: u32, index: usize) -> u32 {
    checksum ^ (0xFF00_0000 >> (8 * index))
}

#[test]
fn test_tampered_checksum_is_reported_at_next_start() {
    for index in 0..CHECKSUM_LEN {
        let (bytes, first_end, first_checksum) = tampered_log(index);
        let mut reader = VersionAwareLogEntryReader::new(InMemoryChannel::from_bytes(bytes))
            .verify_checksum_chain(true);

        let (entries, error) = read_until_error(&mut reader);
        assert_eq!(entries.len(), 3, "byte {index}");
        match error {
            Some(LogEntryError::ChecksumChain(err)) => {
                assert_eq!(err.position, first_end);
                assert_eq!(err.actual, first_checksum);
                assert_eq!(err.expected, flipped(first_checksum, index));
            }
            other => panic!("expected a checksum chain error for byte {index}, got {other:?}"),
        }
    }
}

#[test]
fn test_tampered_checksum_parses_without_verification() {
    for index in 0..CHECKSUM_LEN {
        let (bytes, _, first_checksum) = tampered_log(index);
        let mut reader = VersionAwareLogEntryReader::new(InMemoryChannel::from_bytes(bytes));

        let mut commits = 0;
        while let Some(entry) = reader.read_log_entry().expect("Failed to read") {
            if let LogEntry::Commit(commit) = entry {
                commits += 1;
                if commit.tx_id == 1 {
                    // The bytes no longer match the stored checksum.
                    assert_eq!(commit.checksum, flipped(first_checksum, index));
                    assert_eq!(reader.last_computed_checksum(), Some(first_checksum));
                }
            }
        }
        assert_eq!(commits, 2);
    }
}

#[test]
fn test_tampered_content_stops_replay() {
    let mut log = memory_log();
    let insert = |key: u64| TreeCommand::insert(&SimpleLongLayout, &key, &key).encode();
    log.append(&[insert(1)]).expect("Failed to append");
    let second = log.writer_mut().channel_mut().as_bytes().len();
    log.append(&[insert(2)]).expect("Failed to append");
    log.append(&[insert(3)]).expect("Failed to append");
    let mut bytes = log.into_writer().into_channel().into_bytes();
    // Last key byte of the second transaction's insert.
    bytes[second + 26 + 6 + 1 + 4 + 7] ^= 0x01;

    // Stored checksums are intact, so the chain still holds.
    let mut reader = VersionAwareLogEntryReader::new(InMemoryChannel::from_bytes(bytes.clone()))
        .verify_checksum_chain(true);
    let mut mismatched = Vec::new();
    while let Some(entry) = reader.read_log_entry().expect("Failed to read") {
        if let LogEntry::Commit(commit) = entry
            && reader.last_computed_checksum() != Some(commit.checksum)
        {
            mismatched.push(commit.tx_id);
        }
    }
    assert_eq!(mismatched, vec![2]);

    let store = TestStore::new();
    let tree = store.open_tree();
    let mut reader = VersionAwareLogEntryReader::new(InMemoryChannel::from_bytes(bytes))
        .verify_checksum_chain(true);
    let report = replay(&mut reader, &tree).expect("Failed to replay");
    assert_eq!(report.transactions_replayed, 1);
    assert_eq!(report.last_tx_id, Some(1));
    assert_eq!(report.end_position, second as u64);
    assert_eq!(keys(&tree), vec![1]);
    tree.close().expect("Failed to close");
}

#[test]
fn test_chain_holds_across_version_change() {
    let mut log = memory_log();
    log.writer_mut().set_version(LogEntryVersion::V1);
    log.append(&[b"old"]).expect("Failed to append");
    log.writer_mut().set_version(LogEntryVersion::V2);
    log.append(&[b"new"]).expect("Failed to append");
    log.append(&[b"newer"]).expect("Failed to append");
    let channel = log.into_writer().into_channel();

    let mut reader = VersionAwareLogEntryReader::new(channel.reader()).verify_checksum_chain(true);
    let (entries, error) = read_until_error(&mut reader);
    assert!(error.is_none(), "unexpected error: {error:?}");
    assert_eq!(entries.len(), 9);
    assert_eq!(reader.version(), Some(LogEntryVersion::V2));
    assert_eq!(reader.last_commit_checksum(), reader.last_computed_checksum());
}

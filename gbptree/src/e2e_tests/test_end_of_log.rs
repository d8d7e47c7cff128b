//! Test that the zeroed tail of a preallocated log file reads as the end of
//! the log, every time it is read.

use std::path::Path;

use crate::e2e_tests::helpers::{LOG_PATH, TestStore, memory_log, read_until_error};
use crate::fs::OpenMode;
use crate::wal::{
    LogEntry, LogEntryVersion, LogEntryWriter, PhysicalLogChannel, ReadableChannel, StartEntry,
    TransactionAppender, VersionAwareLogEntryReader, WritableChannel,
};

const PREALLOCATED: u64 = 4096;

fn appender(store: &TestStore) -> TransactionAppender<PhysicalLogChannel> {
    let channel = PhysicalLogChannel::create(store.fs.as_ref(), Path::new(LOG_PATH), PREALLOCATED)
        .expect("Failed to create log");
    TransactionAppender::new(LogEntryWriter::new(channel, LogEntryVersion::V2))
}

fn reader(store: &TestStore) -> VersionAwareLogEntryReader<PhysicalLogChannel> {
    let channel = PhysicalLogChannel::open(store.fs.as_ref(), Path::new(LOG_PATH), OpenMode::Read)
        .expect("Failed to open log");
    VersionAwareLogEntryReader::new(channel).verify_checksum_chain(true)
}

#[test]
fn test_zero_tail_is_end_of_log_on_every_read() {
    let store = TestStore::new();
    let mut log = appender(&store);
    log.append(&[b"first".as_slice()]).expect("Failed to append");
    log.append(&[b"second".as_slice(), b"third".as_slice()])
        .expect("Failed to append");
    log.check_point("test").expect("Failed to write checkpoint");
    drop(log);

    let file = store.fs.read_file(Path::new(LOG_PATH)).expect("Failed to read log");
    assert_eq!(file.len() as u64, PREALLOCATED);

    let mut reader = reader(&store);
    let (entries, error) = read_until_error(&mut reader);
    assert!(error.is_none(), "unexpected error: {error:?}");
    assert_eq!(entries.len(), 8);
    assert!(matches!(entries[7], LogEntry::CheckPoint(_)));

    let end = reader.last_position();
    assert!(end < PREALLOCATED);
    for _ in 0..5 {
        assert!(reader.read_log_entry().expect("Failed to read").is_none());
        assert_eq!(reader.last_position(), end);
        assert_eq!(ReadableChannel::position(reader.channel()), end);
    }
}

#[test]
fn test_unsynced_transaction_is_gone_after_crash() {
    let store = TestStore::new();
    let mut log = appender(&store);
    log.append(&[b"kept".as_slice()]).expect("Failed to append");
    log.append(&[b"also kept".as_slice()]).expect("Failed to append");

    // Written but never flushed.
    let writer = log.writer_mut();
    writer
        .write_start(&StartEntry::default())
        .expect("Failed to write start");
    writer.write_command(b"lost").expect("Failed to write command");
    drop(log);
    store.crash();

    let mut reader = reader(&store);
    let (entries, error) = read_until_error(&mut reader);
    assert!(error.is_none(), "unexpected error: {error:?}");
    assert_eq!(entries.len(), 6);
    assert!(matches!(entries[5], LogEntry::Commit(_)));
    assert!(reader.read_log_entry().expect("Failed to read").is_none());
}

#[test]
fn test_reader_at_zero_tail_sees_appended_transactions() {
    let store = TestStore::new();
    let mut log = appender(&store);
    log.append(&[b"first".as_slice()]).expect("Failed to append");

    let mut reader = reader(&store);
    let (entries, error) = read_until_error(&mut reader);
    assert!(error.is_none(), "unexpected error: {error:?}");
    assert_eq!(entries.len(), 3);
    let end = reader.last_position();

    log.append(&[b"second".as_slice()]).expect("Failed to append");
    let (entries, error) = read_until_error(&mut reader);
    assert!(error.is_none(), "unexpected error: {error:?}");
    assert_eq!(entries.len(), 3);
    assert!(matches!(entries[2], LogEntry::Commit(_)));
    assert!(reader.last_position() > end);
    assert_eq!(reader.last_commit_checksum(), Some(log.last_checksum()));
    assert_eq!(reader.last_computed_checksum(), reader.last_commit_checksum());
}

#[test]
fn test_truncated_commit_reads_completely_once_written() {
    let mut log = memory_log();
    log.append(&[b"payload".as_slice()]).expect("Failed to append");
    let bytes = log.into_writer().into_channel().into_bytes();
    // Inside the commit entry's time field.
    let cut = bytes.len() - 8;

    let store = TestStore::new();
    let mut file = PhysicalLogChannel::create(store.fs.as_ref(), Path::new(LOG_PATH), 0)
        .expect("Failed to create log");
    file.put(&bytes[..cut]).expect("Failed to write");
    file.flush().expect("Failed to flush");

    let mut reader = reader(&store);
    let (entries, error) = read_until_error(&mut reader);
    assert!(error.is_none(), "unexpected error: {error:?}");
    assert_eq!(entries.len(), 2);
    let end = reader.last_position();
    for _ in 0..3 {
        assert!(reader.read_log_entry().expect("Failed to read").is_none());
        assert_eq!(ReadableChannel::position(reader.channel()), end);
    }

    file.put(&bytes[cut..]).expect("Failed to write");
    file.flush().expect("Failed to flush");
    let entry = reader.read_log_entry().expect("Failed to read");
    assert!(matches!(entry, Some(LogEntry::Commit(_))), "{entry:?}");
    assert!(reader.last_commit_checksum().is_some());
    assert_eq!(reader.last_computed_checksum(), reader.last_commit_checksum());
}

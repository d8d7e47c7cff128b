//! Write-ahead log entries.
//!
//! A log is a sequence of entries, each `[version u8][type u8][payload]`.
//! Version `0` never occurs in a written entry: a zero byte where an entry
//! should start marks the unwritten, zero-filled tail of a pre-allocated
//! log file.
//!
//! Entries are grouped into transactions: a start entry, any number of
//! command entries and a commit entry. The commit entry holds the CRC32 of
//! the transaction's bytes and the next start entry repeats it as its
//! previous checksum, chaining transactions together. Checkpoint entries
//! sit between transactions and record that everything up to a
//! transaction id is already in the tree.
//!
//! [`VersionAwareLogEntryReader`] reads logs mixing entry versions;
//! [`TransactionAppender`] writes them; [`replay`] re-applies committed
//! tree commands written after the last checkpoint.

mod channel;
mod command;
mod entry;
mod parser;
mod reader;
mod replay;
mod writer;

pub use channel::{
    ChannelError, ChecksumState, InMemoryChannel, PhysicalLogChannel, ReadableChannel,
    WritableChannel,
};
pub use command::{CommandError, TreeCommand};
pub use entry::{
    CheckPointEntry, CommandEntry, CommitEntry, EntryType, LogEntry, LogEntryVersion, StartEntry,
};
pub use parser::{MAX_PAYLOAD_SIZE, ParseError, ParseFn, parser_for};
pub use reader::{ChecksumChainError, LogEntryError, VersionAwareLogEntryReader};
pub use replay::{ReplayError, ReplayReport, replay};
pub use writer::{LogEntryWriter, LogWriteError, TransactionAppender};

#[cfg(test)]
mod tests {
    use super::*;

    fn two_transactions(version: LogEntryVersion) -> (InMemoryChannel, u64) {
        let mut appender =
            TransactionAppender::new(LogEntryWriter::new(InMemoryChannel::new(), version));
        appender.append(&[b"first"]).expect("append");
        appender.append(&[b"second"]).expect("append");
        let channel = appender.into_writer().into_channel();
        let len = channel.as_bytes().len() as u64;
        (channel, len)
    }

    fn first_error(channel: InMemoryChannel) -> LogEntryError {
        let mut reader = VersionAwareLogEntryReader::new(channel);
        loop {
            match reader.read_log_entry() {
                Ok(Some(_)) => {}
                Ok(None) => panic!("log ended without an error"),
                Err(err) => return err,
            }
        }
    }

    #[test]
    fn test_zero_tail_is_end_of_log_every_time() {
        let (channel, len) = two_transactions(LogEntryVersion::V2);
        let mut bytes = channel.into_bytes();
        bytes.resize(bytes.len() + 512, 0);

        let mut reader = VersionAwareLogEntryReader::new(InMemoryChannel::from_bytes(bytes));
        let mut entries = 0;
        while reader.read_log_entry().expect("read").is_some() {
            entries += 1;
        }
        assert_eq!(entries, 6);
        for _ in 0..5 {
            assert_eq!(reader.read_log_entry().expect("read"), None);
            assert_eq!(reader.last_position(), len);
            assert_eq!(ReadableChannel::position(reader.channel()), len);
        }
    }

    #[test]
    fn test_truncated_entry_is_end_of_log() {
        let (channel, len) = two_transactions(LogEntryVersion::V1);
        let mut bytes = channel.into_bytes();
        // Cut the final commit entry short.
        bytes.truncate(bytes.len() - 3);
        let mut reader = VersionAwareLogEntryReader::new(InMemoryChannel::from_bytes(bytes));

        let entries: Vec<LogEntry> = reader.by_ref().map(|e| e.expect("entry")).collect();
        assert_eq!(entries.len(), 5);
        let resume = reader.last_position();
        assert!(resume < len);
        assert_eq!(reader.read_log_entry().expect("read"), None);
        assert_eq!(reader.last_position(), resume);
    }

    #[test]
    fn test_mixed_versions_read_in_one_pass() {
        let mut appender = TransactionAppender::new(LogEntryWriter::new(
            InMemoryChannel::new(),
            LogEntryVersion::V1,
        ));
        appender.append(&[b"old"]).expect("append");
        appender.writer_mut().set_version(LogEntryVersion::V2);
        appender.append(&[b"new"]).expect("append");
        appender.check_point("upgrade").expect("checkpoint");
        let channel = appender.into_writer().into_channel();

        let mut reader = VersionAwareLogEntryReader::new(channel.reader()).verify_checksum_chain(true);
        let mut versions = Vec::new();
        while let Some(entry) = reader.read_log_entry().expect("read") {
            versions.push((entry.entry_type(), reader.version()));
            if matches!(entry, LogEntry::Commit(_)) {
                assert_eq!(reader.last_commit_checksum(), reader.last_computed_checksum());
            }
        }
        assert_eq!(versions.len(), 7);
        assert_eq!(versions[0], (EntryType::Start, Some(LogEntryVersion::V1)));
        assert_eq!(versions[3], (EntryType::Start, Some(LogEntryVersion::V2)));
        assert_eq!(versions[6], (EntryType::CheckPoint, Some(LogEntryVersion::V2)));
    }

    #[test]
    fn test_unknown_version_and_type_carry_position() {
        let (channel, len) = two_transactions(LogEntryVersion::V2);
        let mut bytes = channel.into_bytes();
        bytes.extend_from_slice(&[9, 1]);
        let err = first_error(InMemoryChannel::from_bytes(bytes.clone()));
        assert!(matches!(
            err,
            LogEntryError::UnknownVersion { position, code: 9 } if position == len
        ));

        let end = bytes.len() - 2;
        bytes[end] = LogEntryVersion::V2.code();
        bytes[end + 1] = 0x42;
        let err = first_error(InMemoryChannel::from_bytes(bytes));
        assert!(matches!(
            err,
            LogEntryError::Parse {
                position,
                version: LogEntryVersion::V2,
                source: ParseError::UnknownEntryType(0x42),
            } if position == len
        ));
    }
}

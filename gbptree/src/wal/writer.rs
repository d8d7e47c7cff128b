//! Writing log entries.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::wal::channel::{ChannelError, WritableChannel};
use crate::wal::entry::{CheckPointEntry, EntryType, LogEntryVersion, StartEntry};

/// Errors writing the log.
#[derive(Debug)]
pub enum LogWriteError {
    Channel(ChannelError),
    /// A field does not fit the width the entry version gives it.
    TooLarge {
        field: &'static str,
        len: usize,
        max: usize,
    },
}

impl std::fmt::Display for LogWriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Channel(err) => write!(f, "{err}"),
            Self::TooLarge { field, len, max } => {
                write!(f, "{field} of {len} bytes exceeds the maximum of {max}")
            }
        }
    }
}

impl std::error::Error for LogWriteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Channel(err) => Some(err),
            Self::TooLarge { .. } => None,
        }
    }
}

impl From<ChannelError> for LogWriteError {
    fn from(err: ChannelError) -> Self {
        Self::Channel(err)
    }
}

fn check_len(field: &'static str, len: usize, max: usize) -> Result<(), LogWriteError> {
    if len > max {
        return Err(LogWriteError::TooLarge { field, len, max });
    }
    Ok(())
}

/// Writes entries of one version.
#[derive(Debug)]
pub struct LogEntryWriter<C: WritableChannel> {
    channel: C,
    version: LogEntryVersion,
}

impl<C: WritableChannel> LogEntryWriter<C> {
    pub const fn new(channel: C, version: LogEntryVersion) -> Self {
        Self { channel, version }
    }

    #[must_use]
    pub const fn version(&self) -> LogEntryVersion {
        self.version
    }

    /// Write later entries in `version`.
    ///
    /// Readers start a checksum segment wherever the version changes, so
    /// the writer does too.
    pub fn set_version(&mut self, version: LogEntryVersion) {
        if version != self.version {
            self.channel.begin_checksum();
            self.version = version;
        }
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    pub fn into_channel(self) -> C {
        self.channel
    }

    fn header(&mut self, entry_type: EntryType) -> Result<(), ChannelError> {
        self.channel.put_u8(self.version.code())?;
        self.channel.put_u8(entry_type.code())
    }

    /// Write a start entry, opening a new checksum segment.
    pub fn write_start(&mut self, start: &StartEntry) -> Result<(), LogWriteError> {
        if self.version == LogEntryVersion::V2 {
            check_len("start header", start.additional_header.len(), u32::MAX as usize)?;
        }
        self.channel.begin_checksum();
        self.header(EntryType::Start)?;
        self.channel.put_u64(start.time_written)?;
        self.channel.put_u64(start.last_committed_tx_id)?;
        self.channel.put_u32(start.previous_checksum)?;
        if self.version == LogEntryVersion::V2 {
            #[allow(clippy::cast_possible_truncation)] // checked above
            self.channel.put_u32(start.additional_header.len() as u32)?;
            self.channel.put(&start.additional_header)?;
        }
        Ok(())
    }

    pub fn write_command(&mut self, payload: &[u8]) -> Result<(), LogWriteError> {
        match self.version {
            LogEntryVersion::V1 => check_len("command", payload.len(), usize::from(u16::MAX))?,
            LogEntryVersion::V2 => check_len("command", payload.len(), u32::MAX as usize)?,
        }
        self.header(EntryType::Command)?;
        #[allow(clippy::cast_possible_truncation)] // checked above
        match self.version {
            LogEntryVersion::V1 => self.channel.put_u16(payload.len() as u16)?,
            LogEntryVersion::V2 => self.channel.put_u32(payload.len() as u32)?,
        }
        self.channel.put(payload)?;
        Ok(())
    }

    /// Write a commit entry closing the checksum segment. Returns the
    /// checksum written.
    pub fn write_commit(&mut self, tx_id: u64, time_written: u64) -> Result<u32, LogWriteError> {
        self.header(EntryType::Commit)?;
        self.channel.put_u64(tx_id)?;
        self.channel.put_u64(time_written)?;
        let checksum = self.channel.end_checksum();
        self.channel.put_u32(checksum)?;
        Ok(checksum)
    }

    pub fn write_check_point(&mut self, check_point: &CheckPointEntry) -> Result<(), LogWriteError> {
        if self.version == LogEntryVersion::V2 {
            check_len("checkpoint reason", check_point.reason.len(), usize::from(u16::MAX))?;
        }
        self.header(EntryType::CheckPoint)?;
        self.channel.put_u64(check_point.last_tx_id)?;
        if self.version == LogEntryVersion::V2 {
            #[allow(clippy::cast_possible_truncation)] // checked above
            self.channel.put_u16(check_point.reason.len() as u16)?;
            self.channel.put(check_point.reason.as_bytes())?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), LogWriteError> {
        self.channel.flush()?;
        Ok(())
    }
}

#[allow(clippy::cast_possible_truncation)] // milliseconds since the epoch fit in u64
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as u64)
}

/// Appends whole transactions, threading the checksum chain from each
/// commit into the next start entry.
#[derive(Debug)]
pub struct TransactionAppender<C: WritableChannel> {
    writer: LogEntryWriter<C>,
    last_tx_id: u64,
    last_checksum: u32,
}

impl<C: WritableChannel> TransactionAppender<C> {
    /// An appender for an empty log.
    pub const fn new(writer: LogEntryWriter<C>) -> Self {
        Self::resume(writer, 0, 0)
    }

    /// An appender continuing after transaction `last_tx_id`, whose commit
    /// carried `last_checksum`.
    pub const fn resume(writer: LogEntryWriter<C>, last_tx_id: u64, last_checksum: u32) -> Self {
        Self {
            writer,
            last_tx_id,
            last_checksum,
        }
    }

    #[must_use]
    pub const fn last_tx_id(&self) -> u64 {
        self.last_tx_id
    }

    #[must_use]
    pub const fn last_checksum(&self) -> u32 {
        self.last_checksum
    }

    pub const fn writer_mut(&mut self) -> &mut LogEntryWriter<C> {
        &mut self.writer
    }

    pub fn into_writer(self) -> LogEntryWriter<C> {
        self.writer
    }

    /// Append one transaction and flush it. Returns its id.
    pub fn append<P: AsRef<[u8]>>(&mut self, commands: &[P]) -> Result<u64, LogWriteError> {
        let tx_id = self.last_tx_id + 1;
        self.writer.write_start(&StartEntry {
            time_written: now_millis(),
            last_committed_tx_id: self.last_tx_id,
            previous_checksum: self.last_checksum,
            additional_header: Vec::new(),
        })?;
        for command in commands {
            self.writer.write_command(command.as_ref())?;
        }
        let checksum = self.writer.write_commit(tx_id, now_millis())?;
        self.writer.flush()?;
        self.last_tx_id = tx_id;
        self.last_checksum = checksum;
        Ok(tx_id)
    }

    /// Record that every transaction appended so far is in the store.
    pub fn check_point(&mut self, reason: &str) -> Result<(), LogWriteError> {
        self.writer.write_check_point(&CheckPointEntry {
            last_tx_id: self.last_tx_id,
            reason: reason.to_string(),
        })?;
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::channel::InMemoryChannel;
    use crate::wal::entry::{CommandEntry, LogEntry};
    use crate::wal::reader::VersionAwareLogEntryReader;

    fn read_all(channel: &InMemoryChannel) -> Vec<LogEntry> {
        VersionAwareLogEntryReader::new(channel.reader())
            .verify_checksum_chain(true)
            .collect::<Result<_, _>>()
            .expect("read log")
    }

    #[test]
    fn test_v1_command_limit() {
        let mut writer = LogEntryWriter::new(InMemoryChannel::new(), LogEntryVersion::V1);
        let payload = vec![0u8; usize::from(u16::MAX) + 1];
        assert!(matches!(
            writer.write_command(&payload),
            Err(LogWriteError::TooLarge { field: "command", .. })
        ));
        writer.set_version(LogEntryVersion::V2);
        writer.write_command(&payload).expect("fits in v2");
    }

    #[test]
    fn test_appended_transactions_chain() {
        let writer = LogEntryWriter::new(InMemoryChannel::new(), LogEntryVersion::V2);
        let mut appender = TransactionAppender::new(writer);
        assert_eq!(appender.append(&[b"one".as_slice()]).expect("append"), 1);
        let first_checksum = appender.last_checksum();
        assert_eq!(appender.append(&[b"two", b"thr"]).expect("append"), 2);
        appender.check_point("test").expect("checkpoint");

        let channel = appender.into_writer().into_channel();
        let entries = read_all(&channel);
        assert_eq!(entries.len(), 8);
        match (&entries[3], &entries[4]) {
            (LogEntry::Start(start), LogEntry::Command(CommandEntry { payload })) => {
                assert_eq!(start.previous_checksum, first_checksum);
                assert_eq!(start.last_committed_tx_id, 1);
                assert_eq!(payload, b"two");
            }
            other => panic!("unexpected entries {other:?}"),
        }
        assert_eq!(
            entries[7],
            LogEntry::CheckPoint(CheckPointEntry {
                last_tx_id: 2,
                reason: "test".to_string(),
            })
        );
    }

    #[test]
    fn test_version_change_inside_transaction_keeps_checksum() {
        let mut writer = LogEntryWriter::new(InMemoryChannel::new(), LogEntryVersion::V2);
        writer.write_start(&StartEntry::default()).expect("start");
        writer.write_command(b"new").expect("command");
        writer.set_version(LogEntryVersion::V1);
        writer.write_command(b"old").expect("command");
        let written = writer.write_commit(1, 0).expect("commit");
        let channel = writer.into_channel();

        let mut reader = VersionAwareLogEntryReader::new(channel.reader()).verify_checksum_chain(true);
        while reader.read_log_entry().expect("read").is_some() {}
        assert_eq!(reader.version(), Some(LogEntryVersion::V1));
        assert_eq!(reader.last_commit_checksum(), Some(written));
        assert_eq!(reader.last_computed_checksum(), Some(written));
    }

    #[test]
    fn test_commit_checksum_matches_reader_computation() {
        let writer = LogEntryWriter::new(InMemoryChannel::new(), LogEntryVersion::V1);
        let mut appender = TransactionAppender::new(writer);
        appender.append(&[b"payload"]).expect("append");
        let channel = appender.into_writer().into_channel();

        let mut reader = VersionAwareLogEntryReader::new(channel.reader());
        while reader.read_log_entry().expect("read").is_some() {}
        assert_eq!(reader.last_commit_checksum(), reader.last_computed_checksum());
        assert!(reader.last_commit_checksum().is_some());
    }
}

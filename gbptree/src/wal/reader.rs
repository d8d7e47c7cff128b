//! Version-aware log entry reader.
//!
//! # Invariants
//!
//! - reading at the end of the log (a zero version byte, or a channel that
//!   ends mid-entry) returns `Ok(None)` and leaves the channel where the
//!   unread entry starts, with the checksum segment and entry version as
//!   they were before the attempt, so reading again gives the same answer
//! - [`VersionAwareLogEntryReader::last_position`] only moves forward past
//!   entries that were returned
//! - a transaction checksum segment starts at the first byte of each start
//!   entry and at every change of entry version

use crate::wal::channel::{ChannelError, ChecksumState, ReadableChannel};
use crate::wal::entry::{EntryType, LogEntry, LogEntryVersion};
use crate::wal::parser::{ParseError, parser_for};

/// A start entry does not carry the checksum of the preceding commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumChainError {
    /// Position of the offending start entry.
    pub position: u64,
    /// Checksum of the last commit entry read.
    pub expected: u32,
    /// Previous checksum declared by the start entry.
    pub actual: u32,
}

impl std::fmt::Display for ChecksumChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "checksum chain broken at {}: start entry declares 0x{:08x}, last commit was 0x{:08x}",
            self.position, self.actual, self.expected
        )
    }
}

impl std::error::Error for ChecksumChainError {}

/// Errors reading the log.
#[derive(Debug)]
pub enum LogEntryError {
    /// An entry could not be parsed.
    Parse {
        position: u64,
        version: LogEntryVersion,
        source: ParseError,
    },
    /// The version byte names no known version.
    UnknownVersion { position: u64, code: u8 },
    ChecksumChain(ChecksumChainError),
    /// Repositioning the channel failed.
    Channel(ChannelError),
}

impl std::fmt::Display for LogEntryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse {
                position,
                version,
                source,
            } => write!(f, "failed to parse {version} entry at {position}: {source}"),
            Self::UnknownVersion { position, code } => {
                write!(f, "unknown log entry version {code} at {position}")
            }
            Self::ChecksumChain(err) => write!(f, "{err}"),
            Self::Channel(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for LogEntryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Parse { source, .. } => Some(source),
            Self::ChecksumChain(err) => Some(err),
            Self::Channel(err) => Some(err),
            Self::UnknownVersion { .. } => None,
        }
    }
}

impl From<ChecksumChainError> for LogEntryError {
    fn from(err: ChecksumChainError) -> Self {
        Self::ChecksumChain(err)
    }
}

impl From<ChannelError> for LogEntryError {
    fn from(err: ChannelError) -> Self {
        Self::Channel(err)
    }
}

/// Reads entries of any known version from a channel.
#[derive(Debug)]
pub struct VersionAwareLogEntryReader<C: ReadableChannel> {
    channel: C,
    version: Option<LogEntryVersion>,
    verify_checksum_chain: bool,
    last_commit_checksum: Option<u32>,
    last_computed_checksum: Option<u32>,
    last_position: u64,
}

impl<C: ReadableChannel> VersionAwareLogEntryReader<C> {
    pub fn new(channel: C) -> Self {
        let last_position = channel.position();
        Self {
            channel,
            version: None,
            verify_checksum_chain: false,
            last_commit_checksum: None,
            last_computed_checksum: None,
            last_position,
        }
    }

    /// Check that every start entry carries the checksum of the commit
    /// entry before it.
    #[must_use]
    pub const fn verify_checksum_chain(mut self, verify: bool) -> Self {
        self.verify_checksum_chain = verify;
        self
    }

    /// Offset just past the last entry returned; where reading resumes.
    #[must_use]
    pub const fn last_position(&self) -> u64 {
        self.last_position
    }

    /// Version of the entries currently being read.
    #[must_use]
    pub const fn version(&self) -> Option<LogEntryVersion> {
        self.version
    }

    /// Checksum recorded in the last commit entry read.
    #[must_use]
    pub const fn last_commit_checksum(&self) -> Option<u32> {
        self.last_commit_checksum
    }

    /// Checksum computed over the bytes of the last transaction read, for
    /// comparison with [`Self::last_commit_checksum`].
    #[must_use]
    pub const fn last_computed_checksum(&self) -> Option<u32> {
        self.last_computed_checksum
    }

    pub const fn channel(&self) -> &C {
        &self.channel
    }

    pub fn into_channel(self) -> C {
        self.channel
    }

    /// Read the next entry, or `None` at the end of the log.
    pub fn read_log_entry(&mut self) -> Result<Option<LogEntry>, LogEntryError> {
        let start = self.channel.position();
        let checksum = self.channel.checksum_state();
        let previous_version = self.version;
        let code = match self.channel.get_u8() {
            Ok(code) => code,
            Err(ChannelError::ReadPastEnd { .. }) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if code == 0 {
            self.rewind(start, checksum, previous_version)?;
            return Ok(None);
        }
        let version = LogEntryVersion::from_code(code).ok_or(LogEntryError::UnknownVersion {
            position: start,
            code,
        })?;
        if self.version != Some(version) {
            tracing::debug!(
                position = start,
                from = ?self.version,
                to = %version,
                "log entry version changed"
            );
            self.version = Some(version);
            self.restart_checksum(start, 1)?;
        }

        let entry = match self.parse_entry(start, version) {
            Ok(entry) => entry,
            Err(err) if err.is_read_past_end() => {
                tracing::debug!(position = start, "log ends in a truncated entry");
                self.rewind(start, checksum, previous_version)?;
                return Ok(None);
            }
            Err(source) => {
                return Err(LogEntryError::Parse {
                    position: start,
                    version,
                    source,
                });
            }
        };

        match &entry {
            LogEntry::Start(start_entry) => {
                if self.verify_checksum_chain
                    && let Some(expected) = self.last_commit_checksum
                    && start_entry.previous_checksum != expected
                {
                    return Err(ChecksumChainError {
                        position: start,
                        expected,
                        actual: start_entry.previous_checksum,
                    }
                    .into());
                }
            }
            LogEntry::Commit(commit) => {
                self.last_commit_checksum = Some(commit.checksum);
                self.last_computed_checksum = Some(self.channel.checksum());
            }
            LogEntry::Command(_) | LogEntry::CheckPoint(_) => {}
        }
        self.last_position = self.channel.position();
        Ok(Some(entry))
    }

    fn parse_entry(&mut self, start: u64, version: LogEntryVersion) -> Result<LogEntry, ParseError> {
        let type_code = self.channel.get_u8()?;
        if type_code == EntryType::Start.code() {
            self.restart_checksum(start, 2)?;
        }
        let parse = parser_for(version, type_code)?;
        parse(&mut self.channel)
    }

    /// Undo a read attempt that found no complete entry at `start`.
    fn rewind(
        &mut self,
        start: u64,
        checksum: ChecksumState,
        version: Option<LogEntryVersion>,
    ) -> Result<(), ChannelError> {
        self.channel.set_position(start)?;
        self.channel.restore_checksum(checksum);
        self.version = version;
        Ok(())
    }

    /// Rewind to `start` and read `header_len` bytes again inside a fresh
    /// checksum segment.
    fn restart_checksum(&mut self, start: u64, header_len: usize) -> Result<(), ChannelError> {
        self.channel.set_position(start)?;
        self.channel.begin_checksum();
        self.channel.get_bytes(header_len).map(drop)
    }
}

impl<C: ReadableChannel> Iterator for VersionAwareLogEntryReader<C> {
    type Item = Result<LogEntry, LogEntryError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_log_entry().transpose()
    }
}

//! Log entry model.

/// Format version of a log entry, written as its first byte.
///
/// Code `0` is never a version: it marks the unwritten tail of a log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogEntryVersion {
    /// 16-bit command lengths, no additional start header, checkpoints
    /// without a reason.
    V1 = 1,
    /// 32-bit command lengths, additional start header bytes, checkpoint
    /// reasons.
    V2 = 2,
}

impl LogEntryVersion {
    pub const LATEST: Self = Self::V2;

    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::V1),
            2 => Some(Self::V2),
            _ => None,
        }
    }
}

impl std::fmt::Display for LogEntryVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "V{}", self.code())
    }
}

/// Entry type codes, written as the second byte of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EntryType {
    Start = 1,
    Command = 2,
    Commit = 3,
    CheckPoint = 4,
}

impl EntryType {
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for EntryType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Start),
            2 => Ok(Self::Command),
            3 => Ok(Self::Commit),
            4 => Ok(Self::CheckPoint),
            _ => Err(value),
        }
    }
}

/// Opens a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StartEntry {
    pub time_written: u64,
    /// Id of the last transaction committed when this one started.
    pub last_committed_tx_id: u64,
    /// Checksum of the previous transaction's commit entry.
    pub previous_checksum: u32,
    /// Opaque bytes, V2 only.
    pub additional_header: Vec<u8>,
}

/// One command of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEntry {
    pub payload: Vec<u8>,
}

/// Closes a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitEntry {
    pub tx_id: u64,
    pub time_written: u64,
    /// CRC32 of the transaction's bytes, from the first byte of its start
    /// entry up to this field.
    pub checksum: u32,
}

/// Marks that every transaction up to `last_tx_id` is in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckPointEntry {
    pub last_tx_id: u64,
    /// Why the checkpoint happened, V2 only.
    pub reason: String,
}

/// A parsed log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    Start(StartEntry),
    Command(CommandEntry),
    Commit(CommitEntry),
    CheckPoint(CheckPointEntry),
}

impl LogEntry {
    #[must_use]
    pub const fn entry_type(&self) -> EntryType {
        match self {
            Self::Start(_) => EntryType::Start,
            Self::Command(_) => EntryType::Command,
            Self::Commit(_) => EntryType::Commit,
            Self::CheckPoint(_) => EntryType::CheckPoint,
        }
    }
}

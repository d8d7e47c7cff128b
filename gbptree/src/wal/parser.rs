//! Per-version entry parsers.
//!
//! Each `(version, type)` pair maps to one parse function through
//! [`parser_for`]. A parse function is handed the channel positioned just
//! after the type byte and reads the rest of the entry.
//!
//! ```text
//!                 V1                              V2
//! Start       time u64, last tx u64,          as V1, then header length u32
//!             previous checksum u32           and header bytes
//! Command     length u16, payload             length u32, payload
//! Commit      tx id u64, time u64, checksum u32 (both versions)
//! CheckPoint  last tx u64                     last tx u64, reason length u16,
//!                                             reason (UTF-8)
//! ```

use std::string::FromUtf8Error;

use crate::wal::channel::{ChannelError, ReadableChannel};
use crate::wal::entry::{
    CheckPointEntry, CommandEntry, CommitEntry, EntryType, LogEntry, LogEntryVersion, StartEntry,
};

/// Largest command payload or start header a parser accepts.
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

/// Why an entry could not be parsed.
#[derive(Debug)]
pub enum ParseError {
    Channel(ChannelError),
    /// No parser for this type code in the active version.
    UnknownEntryType(u8),
    /// A length field exceeds [`MAX_PAYLOAD_SIZE`].
    LengthTooLarge(usize),
    InvalidReason(FromUtf8Error),
}

impl ParseError {
    /// Whether the entry was cut short by the end of the channel.
    #[must_use]
    pub const fn is_read_past_end(&self) -> bool {
        matches!(self, Self::Channel(ChannelError::ReadPastEnd { .. }))
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Channel(err) => write!(f, "{err}"),
            Self::UnknownEntryType(code) => write!(f, "unknown entry type 0x{code:02x}"),
            Self::LengthTooLarge(len) => {
                write!(f, "length {len} exceeds the maximum of {MAX_PAYLOAD_SIZE}")
            }
            Self::InvalidReason(err) => write!(f, "checkpoint reason is not UTF-8: {err}"),
        }
    }
}

impl std::error::Error for ParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Channel(err) => Some(err),
            Self::InvalidReason(err) => Some(err),
            Self::UnknownEntryType(_) | Self::LengthTooLarge(_) => None,
        }
    }
}

impl From<ChannelError> for ParseError {
    fn from(err: ChannelError) -> Self {
        Self::Channel(err)
    }
}

pub type ParseFn = fn(&mut dyn ReadableChannel) -> Result<LogEntry, ParseError>;

const PARSERS: [(LogEntryVersion, EntryType, ParseFn); 8] = [
    (LogEntryVersion::V1, EntryType::Start, parse_start_v1),
    (LogEntryVersion::V1, EntryType::Command, parse_command_v1),
    (LogEntryVersion::V1, EntryType::Commit, parse_commit),
    (LogEntryVersion::V1, EntryType::CheckPoint, parse_check_point_v1),
    (LogEntryVersion::V2, EntryType::Start, parse_start_v2),
    (LogEntryVersion::V2, EntryType::Command, parse_command_v2),
    (LogEntryVersion::V2, EntryType::Commit, parse_commit),
    (LogEntryVersion::V2, EntryType::CheckPoint, parse_check_point_v2),
];

/// The parser for `type_code` entries of `version`.
pub fn parser_for(version: LogEntryVersion, type_code: u8) -> Result<ParseFn, ParseError> {
    let entry_type = EntryType::try_from(type_code).map_err(ParseError::UnknownEntryType)?;
    PARSERS
        .iter()
        .find(|(v, t, _)| *v == version && *t == entry_type)
        .map(|(_, _, parse)| *parse)
        .ok_or(ParseError::UnknownEntryType(type_code))
}

fn checked_len(len: usize) -> Result<usize, ParseError> {
    if len > MAX_PAYLOAD_SIZE {
        return Err(ParseError::LengthTooLarge(len));
    }
    Ok(len)
}

fn parse_start_fields(channel: &mut dyn ReadableChannel) -> Result<StartEntry, ParseError> {
    Ok(StartEntry {
        time_written: channel.get_u64()?,
        last_committed_tx_id: channel.get_u64()?,
        previous_checksum: channel.get_u32()?,
        additional_header: Vec::new(),
    })
}

fn parse_start_v1(channel: &mut dyn ReadableChannel) -> Result<LogEntry, ParseError> {
    parse_start_fields(channel).map(LogEntry::Start)
}

fn parse_start_v2(channel: &mut dyn ReadableChannel) -> Result<LogEntry, ParseError> {
    let mut start = parse_start_fields(channel)?;
    let len = checked_len(channel.get_u32()? as usize)?;
    start.additional_header = channel.get_bytes(len)?;
    Ok(LogEntry::Start(start))
}

fn parse_command_v1(channel: &mut dyn ReadableChannel) -> Result<LogEntry, ParseError> {
    let len = usize::from(channel.get_u16()?);
    Ok(LogEntry::Command(CommandEntry {
        payload: channel.get_bytes(len)?,
    }))
}

fn parse_command_v2(channel: &mut dyn ReadableChannel) -> Result<LogEntry, ParseError> {
    let len = checked_len(channel.get_u32()? as usize)?;
    Ok(LogEntry::Command(CommandEntry {
        payload: channel.get_bytes(len)?,
    }))
}

fn parse_commit(channel: &mut dyn ReadableChannel) -> Result<LogEntry, ParseError> {
    let tx_id = channel.get_u64()?;
    let time_written = channel.get_u64()?;
    channel.end_checksum();
    Ok(LogEntry::Commit(CommitEntry {
        tx_id,
        time_written,
        checksum: channel.get_u32()?,
    }))
}

fn parse_check_point_v1(channel: &mut dyn ReadableChannel) -> Result<LogEntry, ParseError> {
    Ok(LogEntry::CheckPoint(CheckPointEntry {
        last_tx_id: channel.get_u64()?,
        reason: String::new(),
    }))
}

fn parse_check_point_v2(channel: &mut dyn ReadableChannel) -> Result<LogEntry, ParseError> {
    let last_tx_id = channel.get_u64()?;
    let len = usize::from(channel.get_u16()?);
    let reason = String::from_utf8(channel.get_bytes(len)?).map_err(ParseError::InvalidReason)?;
    Ok(LogEntry::CheckPoint(CheckPointEntry { last_tx_id, reason }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::channel::InMemoryChannel;

    #[test]
    fn test_every_version_parses_every_type() {
        for version in [LogEntryVersion::V1, LogEntryVersion::V2] {
            for entry_type in [
                EntryType::Start,
                EntryType::Command,
                EntryType::Commit,
                EntryType::CheckPoint,
            ] {
                assert!(parser_for(version, entry_type.code()).is_ok());
            }
        }
        assert!(matches!(
            parser_for(LogEntryVersion::V2, 0x7f),
            Err(ParseError::UnknownEntryType(0x7f))
        ));
    }

    #[test]
    fn test_command_length_width_differs_per_version() {
        let bytes = vec![0, 3, b'a', b'b', b'c'];
        let parse = parser_for(LogEntryVersion::V1, EntryType::Command.code()).expect("parser");
        let entry = parse(&mut InMemoryChannel::from_bytes(bytes.clone())).expect("v1");
        assert_eq!(
            entry,
            LogEntry::Command(CommandEntry {
                payload: b"abc".to_vec()
            })
        );

        let parse = parser_for(LogEntryVersion::V2, EntryType::Command.code()).expect("parser");
        let err = parse(&mut InMemoryChannel::from_bytes(bytes)).expect_err("too short for v2");
        assert!(err.is_read_past_end());
    }

    #[test]
    fn test_oversized_length_is_rejected() {
        let parse = parser_for(LogEntryVersion::V2, EntryType::Command.code()).expect("parser");
        let mut channel = InMemoryChannel::from_bytes(u32::MAX.to_be_bytes().to_vec());
        assert!(matches!(parse(&mut channel), Err(ParseError::LengthTooLarge(_))));
    }

    #[test]
    fn test_invalid_reason_is_rejected() {
        let mut bytes = 7u64.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0, 2, 0xff, 0xfe]);
        let parse = parser_for(LogEntryVersion::V2, EntryType::CheckPoint.code()).expect("parser");
        assert!(matches!(
            parse(&mut InMemoryChannel::from_bytes(bytes)),
            Err(ParseError::InvalidReason(_))
        ));
    }
}

//! Byte channels the log is read from and written to.
//!
//! Channels keep a running CRC32 over the bytes passing through them.
//! [`ReadableChannel::begin_checksum`] starts a new checksum segment at the
//! current position and [`ReadableChannel::end_checksum`] freezes it, so the
//! checksum of a transaction can be computed while its entries stream by.
//! All multi-byte values are big-endian.

use std::io;
use std::path::{Path, PathBuf};

use crate::fs::{FileSystem, OpenMode, StoreChannel};

const READ_AHEAD: usize = 4096;

/// Errors from a log channel.
#[derive(Debug)]
pub enum ChannelError {
    /// Fewer bytes remain than were asked for.
    ReadPastEnd { position: u64, requested: usize },
    /// Position outside the channel.
    InvalidPosition(u64),
    Io(io::Error),
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadPastEnd {
                position,
                requested,
            } => write!(f, "read of {requested} bytes at {position} is past the end"),
            Self::InvalidPosition(position) => write!(f, "invalid channel position {position}"),
            Self::Io(err) => write!(f, "log channel I/O error: {err}"),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for ChannelError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// Running checksum of one segment.
///
/// Cloned by [`ReadableChannel::checksum_state`] so a reader can undo the
/// bytes it hashed before rewinding.
#[derive(Debug, Clone, Default)]
pub struct ChecksumState {
    hasher: crc32fast::Hasher,
    frozen: Option<u32>,
}

impl ChecksumState {
    fn begin(&mut self) {
        self.hasher = crc32fast::Hasher::new();
        self.frozen = None;
    }

    fn update(&mut self, bytes: &[u8]) {
        if self.frozen.is_none() {
            self.hasher.update(bytes);
        }
    }

    fn end(&mut self) -> u32 {
        let value = self.value();
        self.frozen = Some(value);
        value
    }

    fn value(&self) -> u32 {
        self.frozen.unwrap_or_else(|| self.hasher.clone().finalize())
    }
}

/// A positioned source of log bytes.
pub trait ReadableChannel {
    /// Fill `buf` from the current position and advance past it.
    ///
    /// On `ReadPastEnd` the position is unchanged.
    fn get(&mut self, buf: &mut [u8]) -> Result<(), ChannelError>;

    fn position(&self) -> u64;

    /// Move to `position`, e.g. to rewind over bytes already read.
    fn set_position(&mut self, position: u64) -> Result<(), ChannelError>;

    /// Start a checksum segment at the current position.
    fn begin_checksum(&mut self);

    /// Stop adding bytes to the current segment and return its checksum.
    fn end_checksum(&mut self) -> u32;

    /// Checksum of the current segment so far, or its final value once
    /// ended.
    fn checksum(&self) -> u32;

    /// Snapshot of the current segment.
    fn checksum_state(&self) -> ChecksumState;

    /// Put back a snapshot taken with [`Self::checksum_state`].
    fn restore_checksum(&mut self, state: ChecksumState);

    fn get_u8(&mut self) -> Result<u8, ChannelError> {
        let mut buf = [0u8; 1];
        self.get(&mut buf)?;
        Ok(buf[0])
    }

    fn get_u16(&mut self) -> Result<u16, ChannelError> {
        let mut buf = [0u8; 2];
        self.get(&mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    fn get_u32(&mut self) -> Result<u32, ChannelError> {
        let mut buf = [0u8; 4];
        self.get(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn get_u64(&mut self) -> Result<u64, ChannelError> {
        let mut buf = [0u8; 8];
        self.get(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    fn get_bytes(&mut self, len: usize) -> Result<Vec<u8>, ChannelError> {
        let mut buf = vec![0u8; len];
        self.get(&mut buf)?;
        Ok(buf)
    }
}

/// A positioned sink for log bytes.
pub trait WritableChannel {
    /// Write `bytes` at the current position and advance past them.
    fn put(&mut self, bytes: &[u8]) -> Result<(), ChannelError>;

    fn position(&self) -> u64;

    fn begin_checksum(&mut self);

    fn end_checksum(&mut self) -> u32;

    /// Make everything written so far durable.
    fn flush(&mut self) -> Result<(), ChannelError>;

    fn put_u8(&mut self, value: u8) -> Result<(), ChannelError> {
        self.put(&[value])
    }

    fn put_u16(&mut self, value: u16) -> Result<(), ChannelError> {
        self.put(&value.to_be_bytes())
    }

    fn put_u32(&mut self, value: u32) -> Result<(), ChannelError> {
        self.put(&value.to_be_bytes())
    }

    fn put_u64(&mut self, value: u64) -> Result<(), ChannelError> {
        self.put(&value.to_be_bytes())
    }
}

/// A log held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryChannel {
    data: Vec<u8>,
    position: usize,
    checksum: ChecksumState,
}

impl InMemoryChannel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A channel of `len` zero bytes, like a pre-allocated log file.
    #[must_use]
    pub fn preallocated(len: usize) -> Self {
        Self::from_bytes(vec![0; len])
    }

    /// A channel over existing log bytes, positioned at the start.
    #[must_use]
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data,
            position: 0,
            checksum: ChecksumState::default(),
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// The same bytes, positioned at the start, for reading back.
    #[must_use]
    pub fn reader(&self) -> Self {
        Self::from_bytes(self.data.clone())
    }
}

impl ReadableChannel for InMemoryChannel {
    fn get(&mut self, buf: &mut [u8]) -> Result<(), ChannelError> {
        let end = self.position + buf.len();
        let Some(bytes) = self.data.get(self.position..end) else {
            return Err(ChannelError::ReadPastEnd {
                position: self.position as u64,
                requested: buf.len(),
            });
        };
        buf.copy_from_slice(bytes);
        self.checksum.update(bytes);
        self.position = end;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position as u64
    }

    fn set_position(&mut self, position: u64) -> Result<(), ChannelError> {
        let index = usize::try_from(position).map_err(|_| ChannelError::InvalidPosition(position))?;
        if index > self.data.len() {
            return Err(ChannelError::InvalidPosition(position));
        }
        self.position = index;
        Ok(())
    }

    fn begin_checksum(&mut self) {
        self.checksum.begin();
    }

    fn end_checksum(&mut self) -> u32 {
        self.checksum.end()
    }

    fn checksum(&self) -> u32 {
        self.checksum.value()
    }

    fn checksum_state(&self) -> ChecksumState {
        self.checksum.clone()
    }

    fn restore_checksum(&mut self, state: ChecksumState) {
        self.checksum = state;
    }
}

impl WritableChannel for InMemoryChannel {
    fn put(&mut self, bytes: &[u8]) -> Result<(), ChannelError> {
        let end = self.position + bytes.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[self.position..end].copy_from_slice(bytes);
        self.checksum.update(bytes);
        self.position = end;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position as u64
    }

    fn begin_checksum(&mut self) {
        self.checksum.begin();
    }

    fn end_checksum(&mut self) -> u32 {
        self.checksum.end()
    }

    fn flush(&mut self) -> Result<(), ChannelError> {
        Ok(())
    }
}

/// A log stored in a file.
///
/// Reads go through a small read-ahead buffer; writes go straight to the
/// file and become durable on [`WritableChannel::flush`].
#[derive(Debug)]
pub struct PhysicalLogChannel {
    file: Box<dyn StoreChannel>,
    path: PathBuf,
    position: u64,
    checksum: ChecksumState,
    buffer: Vec<u8>,
    buffer_start: u64,
    /// The buffer ends in bytes a writer may still fill: a short read or a
    /// zeroed tail.
    buffer_open: bool,
}

impl PhysicalLogChannel {
    /// Open an existing log file.
    pub fn open(fs: &dyn FileSystem, path: &Path, mode: OpenMode) -> Result<Self, ChannelError> {
        let file = fs.open(path, mode)?;
        Ok(Self::new(file, path))
    }

    /// Create (or reset) a log file of `preallocate` zero bytes.
    pub fn create(fs: &dyn FileSystem, path: &Path, preallocate: u64) -> Result<Self, ChannelError> {
        let mut file = fs.open(path, OpenMode::Create)?;
        file.truncate(0)?;
        file.truncate(preallocate)?;
        file.force()?;
        tracing::debug!(path = %path.display(), preallocate, "created log file");
        Ok(Self::new(file, path))
    }

    fn new(file: Box<dyn StoreChannel>, path: &Path) -> Self {
        Self {
            file,
            path: path.to_path_buf(),
            position: 0,
            checksum: ChecksumState::default(),
            buffer: Vec::new(),
            buffer_start: 0,
            buffer_open: false,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn buffered(&self, len: usize) -> Option<&[u8]> {
        let offset = usize::try_from(self.position.checked_sub(self.buffer_start)?).ok()?;
        self.buffer.get(offset..offset + len)
    }

    fn fill(&mut self, len: usize) -> Result<(), ChannelError> {
        let mut buffer = vec![0u8; len.max(READ_AHEAD)];
        let n = self.file.read_at(&mut buffer, self.position)?;
        self.buffer_open = n < buffer.len() || buffer[..n].last() == Some(&0);
        buffer.truncate(n);
        self.buffer = buffer;
        self.buffer_start = self.position;
        Ok(())
    }
}

impl ReadableChannel for PhysicalLogChannel {
    fn get(&mut self, buf: &mut [u8]) -> Result<(), ChannelError> {
        if self.buffered(buf.len()).is_none() {
            self.fill(buf.len())?;
        }
        let Some(bytes) = self.buffered(buf.len()) else {
            return Err(ChannelError::ReadPastEnd {
                position: self.position,
                requested: buf.len(),
            });
        };
        buf.copy_from_slice(bytes);
        self.checksum.update(buf);
        self.position += buf.len() as u64;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn set_position(&mut self, position: u64) -> Result<(), ChannelError> {
        let in_buffer = position
            .checked_sub(self.buffer_start)
            .is_some_and(|offset| offset <= self.buffer.len() as u64);
        // Rewinding to the end of the log must see entries appended since.
        if !in_buffer || self.buffer_open {
            self.buffer.clear();
        }
        self.position = position;
        Ok(())
    }

    fn begin_checksum(&mut self) {
        self.checksum.begin();
    }

    fn end_checksum(&mut self) -> u32 {
        self.checksum.end()
    }

    fn checksum(&self) -> u32 {
        self.checksum.value()
    }

    fn checksum_state(&self) -> ChecksumState {
        self.checksum.clone()
    }

    fn restore_checksum(&mut self, state: ChecksumState) {
        self.checksum = state;
    }
}

impl WritableChannel for PhysicalLogChannel {
    fn put(&mut self, bytes: &[u8]) -> Result<(), ChannelError> {
        self.file.write_all_at(bytes, self.position)?;
        self.buffer.clear();
        self.checksum.update(bytes);
        self.position += bytes.len() as u64;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn begin_checksum(&mut self) {
        self.checksum.begin();
    }

    fn end_checksum(&mut self) -> u32 {
        self.checksum.end()
    }

    fn flush(&mut self) -> Result<(), ChannelError> {
        self.file.force()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::EphemeralFileSystem;

    #[test]
    fn test_read_past_end_keeps_position() {
        let mut channel = InMemoryChannel::from_bytes(vec![1, 2, 3]);
        assert_eq!(channel.get_u16().expect("read"), 0x0102);
        assert!(matches!(
            channel.get_u16(),
            Err(ChannelError::ReadPastEnd {
                position: 2,
                requested: 2
            })
        ));
        assert_eq!(ReadableChannel::position(&channel), 2);
        assert_eq!(channel.get_u8().expect("read"), 3);
    }

    #[test]
    fn test_checksum_segments() {
        let mut writer = InMemoryChannel::new();
        writer.put(b"ignored").expect("put");
        WritableChannel::begin_checksum(&mut writer);
        writer.put(b"covered").expect("put");
        let written = WritableChannel::end_checksum(&mut writer);
        writer.put(b"after").expect("put");
        assert_eq!(written, crc32fast::hash(b"covered"));

        let mut reader = writer.reader();
        reader.get_bytes(7).expect("skip");
        ReadableChannel::begin_checksum(&mut reader);
        reader.get_bytes(7).expect("covered");
        assert_eq!(ReadableChannel::end_checksum(&mut reader), written);
        reader.get_bytes(5).expect("after");
        assert_eq!(ReadableChannel::checksum(&reader), written);
    }

    #[test]
    fn test_physical_channel_reads_what_it_wrote() {
        let fs = EphemeralFileSystem::new();
        let path = Path::new("/log");
        let mut channel = PhysicalLogChannel::create(&fs, path, 64).expect("create");
        channel.put_u64(42).expect("put");
        channel.put(&[9; 5000]).expect("put");
        channel.flush().expect("flush");

        let mut reader = PhysicalLogChannel::open(&fs, path, OpenMode::Read).expect("open");
        assert_eq!(reader.get_u64().expect("read"), 42);
        assert_eq!(reader.get_bytes(5000).expect("read"), vec![9; 5000]);
        assert!(matches!(
            reader.get_u8(),
            Err(ChannelError::ReadPastEnd { position: 5008, .. })
        ));
        reader.set_position(4).expect("rewind");
        assert_eq!(reader.get_u32().expect("read"), 42);
    }

    #[test]
    fn test_rewind_over_zero_tail_rereads_file() {
        let fs = EphemeralFileSystem::new();
        let path = Path::new("/log");
        let mut writer = PhysicalLogChannel::create(&fs, path, 16).expect("create");
        let mut reader = PhysicalLogChannel::open(&fs, path, OpenMode::Read).expect("open");
        assert_eq!(reader.get_u8().expect("read"), 0);
        reader.set_position(0).expect("rewind");

        writer.put_u8(7).expect("put");
        assert_eq!(reader.get_u8().expect("read"), 7);
    }

    #[test]
    fn test_restored_checksum_forgets_bytes_read() {
        let mut channel = InMemoryChannel::from_bytes(b"abcdef".to_vec());
        ReadableChannel::begin_checksum(&mut channel);
        channel.get_bytes(3).expect("read");
        let state = channel.checksum_state();
        channel.get_bytes(2).expect("read");
        channel.set_position(3).expect("rewind");
        channel.restore_checksum(state);
        channel.get_bytes(3).expect("read");
        assert_eq!(ReadableChannel::checksum(&channel), crc32fast::hash(b"abcdef"));
    }

    #[test]
    fn test_preallocated_file_reads_zeroes() {
        let fs = EphemeralFileSystem::new();
        let path = Path::new("/log");
        PhysicalLogChannel::create(&fs, path, 16).expect("create");
        let mut reader = PhysicalLogChannel::open(&fs, path, OpenMode::Read).expect("open");
        assert_eq!(reader.get_bytes(16).expect("read"), vec![0; 16]);
    }
}

//! File system abstraction.
//!
//! The page cache and the bootstrapper reach files only through
//! [`FileSystem`], so the same tree code runs against real files
//! ([`DefaultFileSystem`]) or against an in-memory file system that can
//! simulate a crash ([`EphemeralFileSystem`]).

mod default;
mod ephemeral;

use std::fmt::Debug;
use std::io;
use std::path::Path;

pub use default::DefaultFileSystem;
pub use ephemeral::EphemeralFileSystem;

/// How a file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Open an existing file for reading only.
    Read,
    /// Open an existing file for reading and writing.
    ReadWrite,
    /// Open for reading and writing, creating the file if it is missing.
    Create,
}

impl OpenMode {
    #[must_use]
    pub const fn is_writable(self) -> bool {
        !matches!(self, Self::Read)
    }
}

/// A file system holding named, byte-addressable files.
pub trait FileSystem: Send + Sync + Debug {
    /// Open a file.
    fn open(&self, path: &Path, mode: OpenMode) -> io::Result<Box<dyn StoreChannel>>;

    /// Whether a file exists at `path`.
    fn exists(&self, path: &Path) -> bool;

    /// Create a directory and all of its parents.
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Delete a file.
    fn delete_file(&self, path: &Path) -> io::Result<()>;

    /// Size of a file in bytes.
    fn file_size(&self, path: &Path) -> io::Result<u64>;
}

/// An open file.
///
/// Writes are not durable until [`StoreChannel::force`] returns.
pub trait StoreChannel: Send + Debug {
    /// Read into `buf` starting at `offset`.
    ///
    /// Returns the number of bytes read, which is less than `buf.len()` only
    /// when the end of the file was reached.
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Write all of `buf` at `offset`, extending the file if needed.
    fn write_all_at(&mut self, buf: &[u8], offset: u64) -> io::Result<()>;

    /// Set the file length, zero-filling when it grows.
    fn truncate(&mut self, len: u64) -> io::Result<()>;

    /// Current file length.
    fn size(&mut self) -> io::Result<u64>;

    /// Make every previous write durable.
    fn force(&mut self) -> io::Result<()>;
}

pub(crate) fn read_only_error(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::PermissionDenied,
        format!("{} is opened read-only", path.display()),
    )
}

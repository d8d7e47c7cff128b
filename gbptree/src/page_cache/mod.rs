//! Page cache.
//!
//! A [`PageCache`] maps files from a [`FileSystem`] into fixed-size pages.
//! Pages are pinned through a [`PageCursor`], which works on a private copy
//! of the page: readers detect concurrent modification through the page's
//! version stamp ([`PageCursor::should_retry`]), writers publish their copy
//! with [`PageCursor::commit`]. Dirty pages reach the file only on flush,
//! where each page is sealed with a CRC32 that is verified when the page is
//! read back.

mod cursor;
mod page;
mod paged_file;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use cursor::{PageCursor, PageVersion, PinMode};
pub use page::{
    MAX_PAGE_SIZE, MIN_PAGE_SIZE, NULL_PAGE_ID, Page, PageError, PageHeader, PageId, PageType,
};
pub use paged_file::{MapOptions, PagedFile};

use crate::config::validate_page_size;
use crate::fs::{FileSystem, OpenMode};

/// Factory for mapped files sharing one file system and one cache budget.
#[derive(Debug, Clone)]
pub struct PageCache {
    fs: Arc<dyn FileSystem>,
    max_pages_per_file: usize,
}

impl PageCache {
    /// Create a page cache over `fs`, keeping at most `max_pages_per_file`
    /// pages of each mapped file in memory.
    #[must_use]
    pub fn new(fs: Arc<dyn FileSystem>, max_pages_per_file: usize) -> Self {
        Self {
            fs,
            max_pages_per_file: max_pages_per_file.max(1),
        }
    }

    /// The file system this cache maps files from.
    #[must_use]
    pub const fn file_system(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    /// Map a file with the given page size.
    ///
    /// # Pre-conditions
    ///
    /// - `page_size` is a power of two within the supported range
    /// - the file exists unless `options.create` is set
    pub fn map(
        &self,
        path: &Path,
        page_size: usize,
        options: MapOptions,
    ) -> Result<Arc<PagedFile>, PageCacheError> {
        validate_page_size(page_size).map_err(|_| PageCacheError::InvalidPageSize(page_size))?;

        let mode = if options.read_only {
            OpenMode::Read
        } else if options.create {
            OpenMode::Create
        } else {
            OpenMode::ReadWrite
        };
        let channel = self.fs.open(path, mode)?;
        let paged_file =
            PagedFile::open(channel, path, page_size, options, self.max_pages_per_file)?;

        tracing::debug!(
            path = %path.display(),
            page_size,
            pages = paged_file.page_count(),
            read_only = options.read_only,
            "mapped file"
        );
        Ok(Arc::new(paged_file))
    }
}

/// Errors returned by the page cache.
#[derive(Debug)]
pub enum PageCacheError {
    /// I/O error from the underlying file.
    Io(io::Error),
    /// The requested page size is not supported.
    InvalidPageSize(usize),
    /// A page read from the file failed checksum or header validation.
    CorruptPage { page_id: PageId, source: PageError },
    /// A write was attempted on a read-only mapping.
    ReadOnly(PathBuf),
    /// A read cursor was committed.
    NotWritable(PageId),
    /// The mapping has been closed.
    Closed(PathBuf),
    /// An internal lock was poisoned by a panicking thread.
    LockPoisoned,
}

impl std::fmt::Display for PageCacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::InvalidPageSize(size) => write!(f, "unsupported page size: {size}"),
            Self::CorruptPage { page_id, source } => {
                write!(f, "corrupt page {page_id}: {source}")
            }
            Self::ReadOnly(path) => write!(f, "{} is mapped read-only", path.display()),
            Self::NotWritable(page_id) => {
                write!(f, "page {page_id} was pinned for reading and cannot be committed")
            }
            Self::Closed(path) => write!(f, "{} has been closed", path.display()),
            Self::LockPoisoned => write!(f, "page cache lock poisoned"),
        }
    }
}

impl std::error::Error for PageCacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::CorruptPage { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for PageCacheError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

//! Meta page (page 0).
//!
//! The meta record is written once when a tree file is created and never
//! changes afterwards. It is readable from the first [`Meta::PROBE_SIZE`]
//! bytes of the file, so the page size can be learned before the file is
//! mapped.

use std::io;
use std::path::Path;

use crate::config::validate_page_size;
use crate::fs::{FileSystem, OpenMode};
use crate::page_cache::{Page, PageType};
use crate::tree::error::TreeInconsistency;
use crate::tree::layout::Layout;

/// Magic bytes identifying a tree file.
pub const MAGIC: [u8; 8] = *b"GBPTREE\0";

/// Current on-disk format version.
pub const FORMAT_VERSION: u32 = 1;

/// Byte offsets within the meta page.
mod offsets {
    pub const PAGE_TYPE: usize = 0;
    pub const MAGIC: usize = 8;
    pub const FORMAT_VERSION: usize = 16;
    pub const PAGE_SIZE: usize = 20;
    pub const LAYOUT_IDENTIFIER: usize = 24;
    pub const LAYOUT_MAJOR: usize = 32;
    pub const LAYOUT_MINOR: usize = 36;
    pub const KEY_SIZE: usize = 40;
    pub const VALUE_SIZE: usize = 44;
    pub const CHECKSUM: usize = 48;
    pub const END: usize = 52;
}

/// Tree-wide configuration fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Meta {
    pub format_version: u32,
    pub page_size: usize,
    pub layout_identifier: u64,
    pub layout_major_version: u32,
    pub layout_minor_version: u32,
    /// Fixed encoded key size, 0 when keys vary in size.
    pub key_size: u32,
    /// Fixed encoded value size, 0 when values vary in size.
    pub value_size: u32,
}

impl Meta {
    /// Number of leading file bytes that hold the whole meta record.
    pub const PROBE_SIZE: usize = 64;

    /// Meta for a new tree with the given layout and page size.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // encoded sizes are bounded by the page size
    pub fn for_layout<L: Layout + ?Sized>(layout: &L, page_size: usize) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            page_size,
            layout_identifier: layout.identifier(),
            layout_major_version: layout.major_version(),
            layout_minor_version: layout.minor_version(),
            key_size: layout.key_size().unwrap_or(0) as u32,
            value_size: layout.value_size().unwrap_or(0) as u32,
        }
    }

    /// Write the meta record into a page.
    #[allow(clippy::cast_possible_truncation)] // page sizes are at most 1MB
    pub fn write_to_page(&self, page: &mut Page) {
        page.init(PageType::Meta);
        page.write_bytes(offsets::MAGIC, &MAGIC);
        page.write_u32(offsets::FORMAT_VERSION, self.format_version);
        page.write_u32(offsets::PAGE_SIZE, self.page_size as u32);
        page.write_u64(offsets::LAYOUT_IDENTIFIER, self.layout_identifier);
        page.write_u32(offsets::LAYOUT_MAJOR, self.layout_major_version);
        page.write_u32(offsets::LAYOUT_MINOR, self.layout_minor_version);
        page.write_u32(offsets::KEY_SIZE, self.key_size);
        page.write_u32(offsets::VALUE_SIZE, self.value_size);
        let checksum = record_checksum(page.as_bytes());
        page.write_u32(offsets::CHECKSUM, checksum);
    }

    /// Parse the meta record from a page.
    pub fn from_page(page: &Page) -> Result<Self, MetaError> {
        Self::from_bytes(page.as_bytes())
    }

    /// Parse the meta record from the leading bytes of a tree file.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MetaError> {
        if bytes.len() < offsets::END {
            return Err(MetaError::Truncated(bytes.len()));
        }
        let page = Page::from_bytes(bytes[..offsets::END].to_vec());
        if page.is_zeroed() {
            return Err(MetaError::Unwritten);
        }
        if page.read_u8(offsets::PAGE_TYPE) != PageType::Meta as u8 {
            return Err(MetaError::WrongPageType(page.read_u8(offsets::PAGE_TYPE)));
        }
        if page.read_bytes(offsets::MAGIC, MAGIC.len()) != MAGIC {
            return Err(MetaError::InvalidMagic);
        }
        let expected = page.read_u32(offsets::CHECKSUM);
        let actual = record_checksum(page.as_bytes());
        if expected != actual {
            return Err(MetaError::ChecksumMismatch { expected, actual });
        }

        let format_version = page.read_u32(offsets::FORMAT_VERSION);
        if format_version != FORMAT_VERSION {
            return Err(MetaError::UnsupportedVersion(format_version));
        }
        let page_size = page.read_u32(offsets::PAGE_SIZE) as usize;
        validate_page_size(page_size).map_err(|_| MetaError::InvalidPageSize(page_size))?;

        Ok(Self {
            format_version,
            page_size,
            layout_identifier: page.read_u64(offsets::LAYOUT_IDENTIFIER),
            layout_major_version: page.read_u32(offsets::LAYOUT_MAJOR),
            layout_minor_version: page.read_u32(offsets::LAYOUT_MINOR),
            key_size: page.read_u32(offsets::KEY_SIZE),
            value_size: page.read_u32(offsets::VALUE_SIZE),
        })
    }

    /// Read the meta record straight from a file, before it is mapped.
    pub fn read_from_file(fs: &dyn FileSystem, path: &Path) -> Result<Self, MetaError> {
        let mut channel = fs.open(path, OpenMode::Read).map_err(MetaError::Io)?;
        let mut buf = [0u8; Self::PROBE_SIZE];
        let n = channel.read_at(&mut buf, 0).map_err(MetaError::Io)?;
        Self::from_bytes(&buf[..n])
    }

    /// Check that `layout` is the layout this tree was created with.
    pub fn check_layout<L: Layout + ?Sized>(&self, layout: &L) -> Result<(), TreeInconsistency> {
        let expected = Self::for_layout(layout, self.page_size);
        let checks: [(&'static str, u64, u64); 5] = [
            (
                "layout identifier",
                expected.layout_identifier,
                self.layout_identifier,
            ),
            (
                "layout major version",
                u64::from(expected.layout_major_version),
                u64::from(self.layout_major_version),
            ),
            (
                "layout minor version",
                u64::from(expected.layout_minor_version),
                u64::from(self.layout_minor_version),
            ),
            (
                "key size",
                u64::from(expected.key_size),
                u64::from(self.key_size),
            ),
            (
                "value size",
                u64::from(expected.value_size),
                u64::from(self.value_size),
            ),
        ];
        for (field, expected, actual) in checks {
            if expected != actual {
                return Err(TreeInconsistency::MetaMismatch {
                    field,
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                });
            }
        }
        Ok(())
    }
}

fn record_checksum(bytes: &[u8]) -> u32 {
    crc32fast::hash(&bytes[offsets::MAGIC..offsets::CHECKSUM])
}

/// Errors reading the meta record.
#[derive(Debug)]
pub enum MetaError {
    /// I/O error reading the file.
    Io(io::Error),
    /// The file is shorter than the meta record.
    Truncated(usize),
    /// The meta page was never written.
    Unwritten,
    /// Page 0 is not a meta page.
    WrongPageType(u8),
    /// Magic bytes do not match.
    InvalidMagic,
    /// Unsupported format version.
    UnsupportedVersion(u32),
    /// Record checksum mismatch.
    ChecksumMismatch { expected: u32, actual: u32 },
    /// Recorded page size is not supported.
    InvalidPageSize(usize),
}

impl std::fmt::Display for MetaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Truncated(len) => write!(f, "file too short for meta record ({len} bytes)"),
            Self::Unwritten => write!(f, "meta page was never written"),
            Self::WrongPageType(t) => write!(f, "page 0 has type 0x{t:02x}, not meta"),
            Self::InvalidMagic => write!(f, "invalid magic bytes"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported format version: {v}"),
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "meta checksum mismatch: expected {expected}, got {actual}")
            }
            Self::InvalidPageSize(size) => write!(f, "invalid page size: {size}"),
        }
    }
}

impl std::error::Error for MetaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::EphemeralFileSystem;
    use crate::tree::layout::{ByteLayout, SimpleLongLayout};

    #[test]
    fn test_meta_roundtrip() {
        let meta = Meta::for_layout(&SimpleLongLayout, 4096);
        let mut page = Page::new(4096);
        meta.write_to_page(&mut page);

        let restored = Meta::from_page(&page).expect("parse meta");
        assert_eq!(restored, meta);
        assert_eq!(restored.key_size, 8);
        assert_eq!(restored.layout_identifier, SimpleLongLayout::IDENTIFIER);
    }

    #[test]
    fn test_meta_checksum_detects_corruption() {
        let meta = Meta::for_layout(&ByteLayout::raw(), 512);
        let mut page = Page::new(512);
        meta.write_to_page(&mut page);
        page.write_u32(offsets::LAYOUT_MAJOR, 99);

        assert!(matches!(
            Meta::from_page(&page),
            Err(MetaError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_unwritten_and_foreign_files() {
        assert!(matches!(
            Meta::from_bytes(&[0u8; 64]),
            Err(MetaError::Unwritten)
        ));
        assert!(matches!(Meta::from_bytes(&[1u8; 10]), Err(MetaError::Truncated(10))));

        let mut bytes = [0u8; 64];
        bytes[0] = PageType::Meta as u8;
        bytes[8..16].copy_from_slice(b"NOTATREE");
        assert!(matches!(Meta::from_bytes(&bytes), Err(MetaError::InvalidMagic)));
    }

    #[test]
    fn test_read_from_file_from_file() {
        let fs = EphemeralFileSystem::new();
        let path = Path::new("/meta-only");
        let meta = Meta::for_layout(&SimpleLongLayout, 1024);
        let mut page = Page::new(1024);
        meta.write_to_page(&mut page);
        fs.open(path, OpenMode::Create)
            .expect("create")
            .write_all_at(page.as_bytes(), 0)
            .expect("write");

        assert_eq!(Meta::read_from_file(&fs, path).expect("read meta"), meta);
        assert!(matches!(
            Meta::read_from_file(&fs, Path::new("/missing")),
            Err(MetaError::Io(_))
        ));
    }

    #[test]
    fn test_check_layout() {
        let meta = Meta::for_layout(&SimpleLongLayout, 1024);
        assert!(meta.check_layout(&SimpleLongLayout).is_ok());

        let err = meta.check_layout(&ByteLayout::raw()).expect_err("mismatch");
        assert!(matches!(
            err,
            TreeInconsistency::MetaMismatch {
                field: "layout identifier",
                ..
            }
        ));
    }
}

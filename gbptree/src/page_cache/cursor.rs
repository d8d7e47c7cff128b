//! Pinned page cursors.

use std::sync::Arc;

use super::PageCacheError;
use super::page::{Page, PageId};
use super::paged_file::{CachedPage, PagedFile};

/// How a page is pinned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    /// Read the page; the cursor cannot be committed.
    Read,
    /// Read the page, modify the local copy, then commit it.
    Write,
    /// Start from a zeroed page without reading the file, then commit it.
    Overwrite,
}

impl PinMode {
    #[must_use]
    pub const fn is_write(self) -> bool {
        matches!(self, Self::Write | Self::Overwrite)
    }
}

/// A pinned page.
///
/// The cursor owns a private copy of the page taken together with the
/// page's version stamp. Reads never block writers; a reader that needs a
/// consistent view checks [`PageCursor::should_retry`] after reading and
/// re-reads on `true`.
pub struct PageCursor<'a> {
    file: &'a PagedFile,
    page_id: PageId,
    mode: PinMode,
    cached: Arc<CachedPage>,
    page: Page,
    version: u64,
}

impl<'a> PageCursor<'a> {
    pub(crate) const fn new(
        file: &'a PagedFile,
        page_id: PageId,
        mode: PinMode,
        cached: Arc<CachedPage>,
        page: Page,
        version: u64,
    ) -> Self {
        Self {
            file,
            page_id,
            mode,
            cached,
            page,
            version,
        }
    }

    #[must_use]
    pub const fn page_id(&self) -> PageId {
        self.page_id
    }

    #[must_use]
    pub const fn mode(&self) -> PinMode {
        self.mode
    }

    /// The local page copy.
    #[must_use]
    pub const fn page(&self) -> &Page {
        &self.page
    }

    /// Mutable access to the local page copy. Changes are published by
    /// [`PageCursor::commit`].
    pub const fn page_mut(&mut self) -> &mut Page {
        &mut self.page
    }

    #[must_use]
    pub fn get_u8(&self, offset: usize) -> u8 {
        self.page.read_u8(offset)
    }

    pub fn put_u8(&mut self, offset: usize, value: u8) {
        self.page.write_u8(offset, value);
    }

    #[must_use]
    pub fn get_u32(&self, offset: usize) -> u32 {
        self.page.read_u32(offset)
    }

    pub fn put_u32(&mut self, offset: usize, value: u32) {
        self.page.write_u32(offset, value);
    }

    #[must_use]
    pub fn get_u64(&self, offset: usize) -> u64 {
        self.page.read_u64(offset)
    }

    pub fn put_u64(&mut self, offset: usize, value: u64) {
        self.page.write_u64(offset, value);
    }

    /// Version stamp of the snapshot this cursor holds.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Whether the page was committed by someone else since this cursor's
    /// snapshot was taken.
    #[must_use]
    pub fn should_retry(&self) -> bool {
        self.cached.version() != self.version
    }

    /// Keep a handle that can later tell whether this page changed.
    #[must_use]
    pub fn version_handle(&self) -> PageVersion {
        PageVersion {
            cached: Arc::clone(&self.cached),
            version: self.version,
        }
    }

    /// Take a fresh snapshot of the current page content.
    pub fn reload(&mut self) -> Result<(), PageCacheError> {
        let (page, version) = self.cached.snapshot()?;
        self.page = page;
        self.version = version;
        Ok(())
    }

    /// Move to the next page in the file, keeping the pin mode.
    ///
    /// Returns `false` (and stays put) when there is no next page.
    pub fn next(&mut self) -> Result<bool, PageCacheError> {
        let next_id = self.page_id + 1;
        if next_id >= self.file.page_count() {
            return Ok(false);
        }
        let file = self.file;
        *self = file.pin(next_id, self.mode)?;
        Ok(true)
    }

    /// Publish the local copy as the page's new content.
    pub fn commit(&mut self) -> Result<(), PageCacheError> {
        if !self.mode.is_write() {
            return Err(PageCacheError::NotWritable(self.page_id));
        }
        self.version = self.file.commit(self.page_id, &self.cached, &self.page)?;
        Ok(())
    }
}

impl std::fmt::Debug for PageCursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageCursor")
            .field("page_id", &self.page_id)
            .field("mode", &self.mode)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// A page version remembered after its cursor was dropped.
#[derive(Debug, Clone)]
pub struct PageVersion {
    cached: Arc<CachedPage>,
    version: u64,
}

impl PageVersion {
    /// Whether the page has been committed since the version was taken.
    #[must_use]
    pub fn changed(&self) -> bool {
        self.cached.version() != self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{EphemeralFileSystem, FileSystem};
    use crate::page_cache::{MapOptions, PageCache, PageType};
    use std::path::Path;

    fn mapped() -> Arc<PagedFile> {
        let fs: Arc<dyn FileSystem> = Arc::new(EphemeralFileSystem::new());
        PageCache::new(fs, 16)
            .map(Path::new("/cursor"), 256, MapOptions::create())
            .expect("map")
    }

    #[test]
    fn test_next_walks_pages_in_order() {
        let file = mapped();
        for id in 0..4 {
            let mut cursor = file.pin(id, PinMode::Overwrite).expect("pin");
            cursor.page_mut().init(PageType::FreeList);
            cursor.put_u64(8, id * 10);
            cursor.commit().expect("commit");
        }

        let mut cursor = file.pin(0, PinMode::Read).expect("pin");
        let mut seen = vec![cursor.get_u64(8)];
        while cursor.next().expect("next") {
            seen.push(cursor.get_u64(8));
        }
        assert_eq!(seen, vec![0, 10, 20, 30]);
        assert_eq!(cursor.page_id(), 3);
    }

    #[test]
    fn test_version_handle_outlives_cursor() {
        let file = mapped();
        let handle = {
            let mut cursor = file.pin(1, PinMode::Overwrite).expect("pin");
            cursor.put_u8(0, PageType::TreeNode as u8);
            cursor.commit().expect("commit");
            cursor.version_handle()
        };
        assert!(!handle.changed());

        let mut writer = file.pin(1, PinMode::Write).expect("pin");
        writer.put_u32(20, 5);
        writer.commit().expect("commit");
        assert!(handle.changed());
    }

    #[test]
    fn test_reload_refreshes_snapshot() {
        let file = mapped();
        let mut reader = file.pin(2, PinMode::Read).expect("pin");
        let mut writer = file.pin(2, PinMode::Write).expect("pin");
        writer.put_u64(40, 77);
        writer.commit().expect("commit");

        assert!(reader.should_retry());
        reader.reload().expect("reload");
        assert!(!reader.should_retry());
        assert_eq!(reader.get_u64(40), 77);
    }
}

//! A single file mapped into cached pages.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use super::cursor::{PageCursor, PinMode};
use super::page::{Page, PageId};
use super::PageCacheError;
use crate::fs::StoreChannel;

/// Options for mapping a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapOptions {
    /// Create the file if it does not exist.
    pub create: bool,
    /// Reject every write.
    pub read_only: bool,
    /// Verify page checksums when pages are read from the file.
    pub verify_checksums: bool,
}

impl Default for MapOptions {
    fn default() -> Self {
        Self {
            create: false,
            read_only: false,
            verify_checksums: true,
        }
    }
}

impl MapOptions {
    #[must_use]
    pub const fn create() -> Self {
        Self {
            create: true,
            read_only: false,
            verify_checksums: true,
        }
    }

    #[must_use]
    pub const fn read_only() -> Self {
        Self {
            create: false,
            read_only: true,
            verify_checksums: true,
        }
    }
}

/// A cached page shared between cursors.
///
/// `version` is bumped on every commit while the page lock is held, so a
/// snapshot taken under the read lock pairs a content copy with the version
/// it belongs to.
#[derive(Debug)]
pub(crate) struct CachedPage {
    page: RwLock<Page>,
    version: AtomicU64,
    dirty: AtomicBool,
}

impl CachedPage {
    fn new(page: Page) -> Self {
        Self {
            page: RwLock::new(page),
            version: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
        }
    }

    pub(crate) fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Copy of the page content and the version it was taken at.
    pub(crate) fn snapshot(&self) -> Result<(Page, u64), PageCacheError> {
        let page = self.page.read().map_err(|_| PageCacheError::LockPoisoned)?;
        Ok((page.clone(), self.version()))
    }
}

/// A file mapped into pages of a fixed size.
///
/// # Invariants
///
/// - page `n` lives at byte offset `n * page_size`
/// - a page read from the file either is all zeroes or carries a valid
///   checksum (when checksum verification is enabled)
/// - at most `max_pages` pages stay cached once unpinned
#[derive(Debug)]
pub struct PagedFile {
    path: PathBuf,
    page_size: usize,
    options: MapOptions,
    max_pages: usize,
    channel: Mutex<Box<dyn StoreChannel>>,
    pages: RwLock<HashMap<PageId, Arc<CachedPage>>>,
    page_count: AtomicU64,
    closed: AtomicBool,
}

impl PagedFile {
    pub(crate) fn open(
        mut channel: Box<dyn StoreChannel>,
        path: &Path,
        page_size: usize,
        options: MapOptions,
        max_pages: usize,
    ) -> Result<Self, PageCacheError> {
        let size = channel.size()?;
        let page_count = size.div_ceil(page_size as u64);
        Ok(Self {
            path: path.to_path_buf(),
            page_size,
            options,
            max_pages,
            channel: Mutex::new(channel),
            pages: RwLock::new(HashMap::new()),
            page_count: AtomicU64::new(page_count),
            closed: AtomicBool::new(false),
        })
    }

    /// Path of the mapped file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Page size in bytes.
    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    /// Whether the mapping rejects writes.
    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        self.options.read_only
    }

    /// Number of pages in the file, including pages committed in memory but
    /// not yet flushed.
    #[must_use]
    pub fn page_count(&self) -> u64 {
        self.page_count.load(Ordering::Acquire)
    }

    /// Pin a page.
    ///
    /// `PinMode::Read` and `PinMode::Write` load the page content;
    /// `PinMode::Overwrite` starts from a zeroed page without reading the file.
    pub fn pin(&self, page_id: PageId, mode: PinMode) -> Result<PageCursor<'_>, PageCacheError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PageCacheError::Closed(self.path.clone()));
        }
        if mode.is_write() && self.options.read_only {
            return Err(PageCacheError::ReadOnly(self.path.clone()));
        }

        let cached = self.load(page_id, mode == PinMode::Overwrite)?;
        let (page, version) = if mode == PinMode::Overwrite {
            (Page::new(self.page_size), cached.version())
        } else {
            cached.snapshot()?
        };
        Ok(PageCursor::new(self, page_id, mode, cached, page, version))
    }

    /// Publish a new page image and mark it dirty.
    pub(crate) fn commit(
        &self,
        page_id: PageId,
        cached: &CachedPage,
        content: &Page,
    ) -> Result<u64, PageCacheError> {
        if self.options.read_only {
            return Err(PageCacheError::ReadOnly(self.path.clone()));
        }
        let mut page = cached
            .page
            .write()
            .map_err(|_| PageCacheError::LockPoisoned)?;
        page.as_bytes_mut().copy_from_slice(content.as_bytes());
        cached.dirty.store(true, Ordering::Release);
        let version = cached.version.fetch_add(1, Ordering::AcqRel) + 1;
        drop(page);

        self.page_count.fetch_max(page_id + 1, Ordering::AcqRel);
        Ok(version)
    }

    /// Write every dirty page to the file and force it to durable storage.
    ///
    /// Returns the number of pages written.
    pub fn flush_and_force(&self) -> Result<usize, PageCacheError> {
        let dirty: Vec<(PageId, Arc<CachedPage>)> = {
            let pages = self.pages.read().map_err(|_| PageCacheError::LockPoisoned)?;
            pages
                .iter()
                .filter(|(_, cached)| cached.dirty.load(Ordering::Acquire))
                .map(|(id, cached)| (*id, Arc::clone(cached)))
                .collect()
        };

        let mut written = 0;
        for (page_id, cached) in &dirty {
            if self.write_back(*page_id, cached)? {
                written += 1;
            }
        }
        self.force()?;
        Ok(written)
    }

    /// Write the given pages (if dirty) and force the file.
    pub fn flush_pages(&self, page_ids: &[PageId]) -> Result<(), PageCacheError> {
        for page_id in page_ids {
            let cached = {
                let pages = self.pages.read().map_err(|_| PageCacheError::LockPoisoned)?;
                pages.get(page_id).map(Arc::clone)
            };
            if let Some(cached) = cached {
                self.write_back(*page_id, &cached)?;
            }
        }
        self.force()
    }

    /// Stop serving pins. Unflushed changes are discarded.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            if let Ok(mut pages) = self.pages.write() {
                pages.clear();
            }
            tracing::debug!(path = %self.path.display(), "unmapped file");
        }
    }

    /// Whether [`PagedFile::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn force(&self) -> Result<(), PageCacheError> {
        if self.options.read_only {
            return Ok(());
        }
        let mut channel = self
            .channel
            .lock()
            .map_err(|_| PageCacheError::LockPoisoned)?;
        channel.force()?;
        Ok(())
    }

    /// Write one page if it is dirty. Returns whether it was written.
    fn write_back(&self, page_id: PageId, cached: &CachedPage) -> Result<bool, PageCacheError> {
        if !cached.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }
        let (mut page, _) = cached.snapshot()?;
        page.seal();

        let result = self
            .channel
            .lock()
            .map_err(|_| PageCacheError::LockPoisoned)
            .and_then(|mut channel| {
                channel
                    .write_all_at(page.as_bytes(), self.offset(page_id))
                    .map_err(PageCacheError::Io)
            });
        if result.is_err() {
            cached.dirty.store(true, Ordering::Release);
        }
        result.map(|()| true)
    }

    fn offset(&self, page_id: PageId) -> u64 {
        page_id * self.page_size as u64
    }

    fn load(&self, page_id: PageId, fresh: bool) -> Result<Arc<CachedPage>, PageCacheError> {
        {
            let pages = self.pages.read().map_err(|_| PageCacheError::LockPoisoned)?;
            if let Some(cached) = pages.get(&page_id) {
                return Ok(Arc::clone(cached));
            }
        }

        let page = if fresh {
            Page::new(self.page_size)
        } else {
            self.read_from_file(page_id)?
        };

        let mut pages = self.pages.write().map_err(|_| PageCacheError::LockPoisoned)?;
        let cached = Arc::clone(
            pages
                .entry(page_id)
                .or_insert_with(|| Arc::new(CachedPage::new(page))),
        );
        self.evict(&mut pages, page_id)?;
        Ok(cached)
    }

    fn read_from_file(&self, page_id: PageId) -> Result<Page, PageCacheError> {
        let mut page = Page::new(self.page_size);
        {
            let mut channel = self
                .channel
                .lock()
                .map_err(|_| PageCacheError::LockPoisoned)?;
            // A short read leaves the tail zeroed: the page was never written.
            channel.read_at(page.as_bytes_mut(), self.offset(page_id))?;
        }
        if self.options.verify_checksums {
            page.verify_checksum()
                .map_err(|source| PageCacheError::CorruptPage { page_id, source })?;
        }
        Ok(page)
    }

    /// Drop unpinned pages until the cache is within budget. Clean pages go
    /// first; dirty ones are written back before they are dropped.
    fn evict(
        &self,
        pages: &mut HashMap<PageId, Arc<CachedPage>>,
        keep: PageId,
    ) -> Result<(), PageCacheError> {
        if pages.len() <= self.max_pages {
            return Ok(());
        }
        let unpinned = |id: &PageId, cached: &Arc<CachedPage>| {
            *id != keep && Arc::strong_count(cached) == 1
        };

        let clean: Vec<PageId> = pages
            .iter()
            .filter(|(id, cached)| unpinned(id, cached) && !cached.dirty.load(Ordering::Acquire))
            .map(|(id, _)| *id)
            .collect();
        for id in clean {
            if pages.len() <= self.max_pages {
                return Ok(());
            }
            pages.remove(&id);
        }

        let dirty: Vec<PageId> = pages
            .iter()
            .filter(|(id, cached)| unpinned(id, cached))
            .map(|(id, _)| *id)
            .collect();
        for id in dirty {
            if pages.len() <= self.max_pages {
                break;
            }
            if let Some(cached) = pages.get(&id) {
                self.write_back(id, cached)?;
            }
            pages.remove(&id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{EphemeralFileSystem, FileSystem};
    use crate::page_cache::{PageCache, PageType};
    use std::path::Path;

    const PAGE_SIZE: usize = 256;

    fn cache(fs: &Arc<EphemeralFileSystem>, max_pages: usize) -> PageCache {
        PageCache::new(Arc::clone(fs) as Arc<dyn FileSystem>, max_pages)
    }

    fn write_page(file: &PagedFile, page_id: PageId, value: u64) {
        let mut cursor = file.pin(page_id, PinMode::Overwrite).expect("pin");
        cursor.page_mut().init(PageType::TreeNode);
        cursor.put_u64(16, value);
        cursor.commit().expect("commit");
    }

    fn read_value(file: &PagedFile, page_id: PageId) -> u64 {
        file.pin(page_id, PinMode::Read).expect("pin").get_u64(16)
    }

    #[test]
    fn test_committed_pages_survive_flush_and_remap() {
        let fs = Arc::new(EphemeralFileSystem::new());
        let path = Path::new("/paged");
        let cache = cache(&fs, 8);

        let file = cache
            .map(path, PAGE_SIZE, MapOptions::create())
            .expect("map");
        write_page(&file, 3, 42);
        assert_eq!(file.page_count(), 4);
        assert_eq!(file.flush_and_force().expect("flush"), 1);
        file.close();

        let file = cache
            .map(path, PAGE_SIZE, MapOptions::read_only())
            .expect("remap");
        assert_eq!(file.page_count(), 4);
        assert_eq!(read_value(&file, 3), 42);
        // Pages before the written one were never written: zeroed.
        assert!(file.pin(1, PinMode::Read).expect("pin").page().is_zeroed());
    }

    #[test]
    fn test_unflushed_pages_are_lost_on_crash() {
        let fs = Arc::new(EphemeralFileSystem::new());
        let path = Path::new("/crashy");
        let cache = cache(&fs, 8);

        let file = cache
            .map(path, PAGE_SIZE, MapOptions::create())
            .expect("map");
        write_page(&file, 1, 1);
        file.flush_and_force().expect("flush");
        write_page(&file, 1, 2);
        drop(file);
        fs.crash().expect("crash");

        let file = cache.map(path, PAGE_SIZE, MapOptions::default()).expect("remap");
        assert_eq!(read_value(&file, 1), 1);
    }

    #[test]
    fn test_corrupt_page_is_detected_on_load() {
        let fs = Arc::new(EphemeralFileSystem::new());
        let path = Path::new("/corrupt");
        let cache = cache(&fs, 8);

        let file = cache
            .map(path, PAGE_SIZE, MapOptions::create())
            .expect("map");
        write_page(&file, 2, 7);
        file.flush_and_force().expect("flush");
        drop(file);

        fs.corrupt_byte(path, 2 * PAGE_SIZE as u64 + 100)
            .expect("corrupt");
        let file = cache.map(path, PAGE_SIZE, MapOptions::default()).expect("remap");
        let err = file.pin(2, PinMode::Read).expect_err("should detect");
        assert!(matches!(err, PageCacheError::CorruptPage { page_id: 2, .. }));
    }

    #[test]
    fn test_version_changes_on_commit() {
        let fs = Arc::new(EphemeralFileSystem::new());
        let cache = cache(&fs, 8);
        let file = cache
            .map(Path::new("/versions"), PAGE_SIZE, MapOptions::create())
            .expect("map");
        write_page(&file, 5, 1);

        let reader = file.pin(5, PinMode::Read).expect("pin");
        assert!(!reader.should_retry());
        write_page(&file, 5, 2);
        assert!(reader.should_retry());
        assert_eq!(reader.get_u64(16), 1, "reader keeps its snapshot");
        assert_eq!(read_value(&file, 5), 2);
    }

    #[test]
    fn test_eviction_writes_back_dirty_pages() {
        let fs = Arc::new(EphemeralFileSystem::new());
        let cache = cache(&fs, 2);
        let file = cache
            .map(Path::new("/evict"), PAGE_SIZE, MapOptions::create())
            .expect("map");

        for id in 1..=10 {
            write_page(&file, id, id * 100);
        }
        for id in 1..=10 {
            assert_eq!(read_value(&file, id), id * 100);
        }
    }

    #[test]
    fn test_read_only_mapping_rejects_writes() {
        let fs = Arc::new(EphemeralFileSystem::new());
        let path = Path::new("/ro");
        let cache = cache(&fs, 4);
        let file = cache
            .map(path, PAGE_SIZE, MapOptions::create())
            .expect("map");
        write_page(&file, 1, 1);
        file.flush_and_force().expect("flush");

        let file = cache.map(path, PAGE_SIZE, MapOptions::read_only()).expect("map");
        assert!(matches!(
            file.pin(1, PinMode::Write),
            Err(PageCacheError::ReadOnly(_))
        ));
        let mut cursor = file.pin(1, PinMode::Read).expect("pin");
        assert!(matches!(cursor.commit(), Err(PageCacheError::NotWritable(1))));
    }

    #[test]
    fn test_closed_file_rejects_pins() {
        let fs = Arc::new(EphemeralFileSystem::new());
        let cache = cache(&fs, 4);
        let file = cache
            .map(Path::new("/closed"), PAGE_SIZE, MapOptions::create())
            .expect("map");
        file.close();
        assert!(file.is_closed());
        assert!(matches!(file.pin(0, PinMode::Read), Err(PageCacheError::Closed(_))));
    }

    #[test]
    fn test_rejects_invalid_page_size() {
        let fs = Arc::new(EphemeralFileSystem::new());
        let cache = cache(&fs, 4);
        assert!(matches!(
            cache.map(Path::new("/bad"), 1000, MapOptions::create()),
            Err(PageCacheError::InvalidPageSize(1000))
        ));
    }
}

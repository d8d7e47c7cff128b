//! Free page ids.
//!
//! A released page may still be referenced by the last checkpointed tree,
//! so it is tagged with the generation that released it and handed out
//! again only once that generation has become stable. At checkpoint the list
//! is persisted as a chain of free-list pages:
//!
//! ```text
//! 8   next page id (u64, 0 = end of chain)
//! 16  entry count in this page (u32)
//! 24  entries: (page id u64, generation u64)
//! ```

use std::collections::VecDeque;

use crate::page_cache::{NULL_PAGE_ID, PageId, PageType, PagedFile, PinMode};
use crate::tree::error::GBPTreeError;
use crate::tree::pointer::Generation;

mod offsets {
    pub const NEXT: usize = 8;
    pub const COUNT: usize = 16;
    pub const ENTRIES: usize = 24;
}

const ENTRY_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeEntry {
    pub id: PageId,
    pub generation: u64,
}

/// Free page ids plus the high-water mark of allocated ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeList {
    entries: VecDeque<FreeEntry>,
    last_id: PageId,
    /// Pages holding the persisted chain.
    chain: Vec<PageId>,
}

impl FreeList {
    /// An empty list for a tree whose highest allocated id is `last_id`.
    #[must_use]
    pub const fn new(last_id: PageId) -> Self {
        Self {
            entries: VecDeque::new(),
            last_id,
            chain: Vec::new(),
        }
    }

    /// Entries that fit in one chain page.
    #[must_use]
    pub const fn entries_per_page(page_size: usize) -> usize {
        (page_size - offsets::ENTRIES) / ENTRY_SIZE
    }

    #[must_use]
    pub const fn last_id(&self) -> PageId {
        self.last_id
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Head of the persisted chain.
    #[must_use]
    pub fn head(&self) -> PageId {
        self.chain.first().copied().unwrap_or(NULL_PAGE_ID)
    }

    /// Pages of the persisted chain.
    #[must_use]
    pub fn chain_pages(&self) -> &[PageId] {
        &self.chain
    }

    pub fn iter(&self) -> impl Iterator<Item = &FreeEntry> {
        self.entries.iter()
    }

    /// Whether `id` is currently free.
    #[must_use]
    pub fn contains(&self, id: PageId) -> bool {
        self.entries.iter().any(|entry| entry.id == id)
    }

    /// Hand out a page id: the oldest free id whose release is stable, else
    /// a new id past the high-water mark.
    pub fn acquire(&mut self, generation: Generation) -> PageId {
        if let Some(front) = self.entries.front()
            && front.generation <= generation.stable
        {
            let id = front.id;
            self.entries.pop_front();
            return id;
        }
        self.last_id += 1;
        self.last_id
    }

    /// Release a page id in the current unstable generation.
    pub fn release(&mut self, id: PageId, generation: Generation) {
        self.entries.push_back(FreeEntry {
            id,
            generation: generation.unstable,
        });
    }

    /// Read a persisted chain.
    pub fn load(
        paged_file: &PagedFile,
        head: PageId,
        count: u64,
        last_id: PageId,
    ) -> Result<Self, GBPTreeError> {
        let mut list = Self::new(last_id);
        let mut next = head;
        while next != NULL_PAGE_ID {
            if next > last_id || list.chain.contains(&next) {
                return Err(GBPTreeError::corrupt(next, "free-list chain is malformed"));
            }
            let cursor = paged_file.pin(next, PinMode::Read)?;
            let page = cursor.page();
            if page.read_u8(0) != PageType::FreeList as u8 {
                return Err(GBPTreeError::corrupt(next, "expected a free-list page"));
            }
            let entries = page.read_u32(offsets::COUNT) as usize;
            if entries > Self::entries_per_page(page.size()) {
                return Err(GBPTreeError::corrupt(next, "free-list page overflows"));
            }
            for i in 0..entries {
                let offset = offsets::ENTRIES + i * ENTRY_SIZE;
                list.entries.push_back(FreeEntry {
                    id: page.read_u64(offset),
                    generation: page.read_u64(offset + 8),
                });
            }
            list.chain.push(next);
            next = page.read_u64(offsets::NEXT);
        }
        if list.entries.len() as u64 != count {
            return Err(GBPTreeError::corrupt(
                head,
                format!(
                    "free list holds {} entries, state records {count}",
                    list.entries.len()
                ),
            ));
        }
        Ok(list)
    }

    /// Write the list as a new chain of pages.
    ///
    /// The previous chain pages are released first; they stay referenced by
    /// the last checkpoint until the state about to be written replaces it.
    /// Returns the new head.
    #[allow(clippy::cast_possible_truncation)] // per-page counts are bounded by the page size
    pub fn persist(
        &mut self,
        paged_file: &PagedFile,
        generation: Generation,
    ) -> Result<PageId, GBPTreeError> {
        for id in std::mem::take(&mut self.chain) {
            self.release(id, generation);
        }

        let per_page = Self::entries_per_page(paged_file.page_size());
        let mut chain = Vec::new();
        while chain.len() < self.entries.len().div_ceil(per_page) {
            chain.push(self.acquire(generation));
        }

        let entries: Vec<FreeEntry> = self.entries.iter().copied().collect();
        for (i, id) in chain.iter().enumerate() {
            let batch = entries.chunks(per_page).nth(i).unwrap_or(&[]);
            let mut cursor = paged_file.pin(*id, PinMode::Overwrite)?;
            let page = cursor.page_mut();
            page.init(PageType::FreeList);
            page.write_u64(
                offsets::NEXT,
                chain.get(i + 1).copied().unwrap_or(NULL_PAGE_ID),
            );
            page.write_u32(offsets::COUNT, batch.len() as u32);
            for (j, entry) in batch.iter().enumerate() {
                let offset = offsets::ENTRIES + j * ENTRY_SIZE;
                page.write_u64(offset, entry.id);
                page.write_u64(offset + 8, entry.generation);
            }
            cursor.commit()?;
        }

        self.chain = chain;
        Ok(self.head())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{EphemeralFileSystem, FileSystem};
    use crate::page_cache::{MapOptions, PageCache};
    use std::path::Path;
    use std::sync::Arc;

    fn mapped() -> Arc<PagedFile> {
        let fs: Arc<dyn FileSystem> = Arc::new(EphemeralFileSystem::new());
        PageCache::new(fs, 64)
            .map(Path::new("/free"), 256, MapOptions::create())
            .expect("map")
    }

    #[test]
    fn test_released_ids_wait_for_stable_generation() {
        let generation = Generation::new(1, 2);
        let mut list = FreeList::new(10);
        list.release(5, generation);
        assert_eq!(list.acquire(generation), 11);

        let next = generation.next_checkpoint();
        assert_eq!(list.acquire(next), 5);
        assert_eq!(list.acquire(next), 12);
        assert_eq!(list.last_id(), 12);
    }

    #[test]
    fn test_acquire_is_fifo() {
        let mut list = FreeList::new(20);
        let g = Generation::new(1, 2);
        for id in [7, 3, 9] {
            list.release(id, g);
        }
        let g = g.next_checkpoint();
        assert_eq!(
            [list.acquire(g), list.acquire(g), list.acquire(g)],
            [7, 3, 9]
        );
    }

    #[test]
    fn test_persist_and_load_chain() {
        let file = mapped();
        let g = Generation::new(1, 2);
        let mut list = FreeList::new(100);
        let per_page = FreeList::entries_per_page(256);
        for id in 0..(per_page as u64 * 2 + 3) {
            list.release(3 + id, g);
        }
        let head = list.persist(&file, g).expect("persist");
        assert_ne!(head, NULL_PAGE_ID);
        assert_eq!(list.chain_pages().len(), 3);
        // Entries were released in an unstable generation: the chain grows
        // the file instead of consuming them.
        assert_eq!(list.chain_pages(), &[101, 102, 103]);

        let loaded =
            FreeList::load(&file, head, list.len() as u64, list.last_id()).expect("load");
        assert_eq!(loaded, list);
    }

    #[test]
    fn test_persist_releases_previous_chain() {
        let file = mapped();
        let mut g = Generation::new(1, 2);
        let mut list = FreeList::new(10);
        list.release(4, g);
        list.persist(&file, g).expect("persist");
        let first_chain = list.chain_pages().to_vec();

        g = g.next_checkpoint();
        list.persist(&file, g).expect("persist again");
        for id in &first_chain {
            assert!(list.contains(*id));
        }
        // The stable entry now backs the chain itself.
        assert_eq!(list.chain_pages(), &[4]);
        assert!(!list.contains(4));
    }

    #[test]
    fn test_empty_list_has_no_chain() {
        let file = mapped();
        let mut list = FreeList::new(3);
        assert_eq!(
            list.persist(&file, Generation::new(1, 2)).expect("persist"),
            NULL_PAGE_ID
        );
        let loaded = FreeList::load(&file, NULL_PAGE_ID, 0, 3).expect("load");
        assert!(loaded.is_empty());
    }

    #[test]
    fn test_load_rejects_count_mismatch() {
        let file = mapped();
        let g = Generation::new(1, 2);
        let mut list = FreeList::new(10);
        list.release(4, g);
        let head = list.persist(&file, g).expect("persist");
        assert!(
            FreeList::load(&file, head, 5, list.last_id())
                .expect_err("count mismatch")
                .is_inconsistency()
        );
    }
}

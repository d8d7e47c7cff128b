//! Common helpers for end-to-end tests.

use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use crate::bootstrap::{Bootstrap, DefaultLayoutBootstrapper, GBPTreeBootstrapper};
use crate::collector::{ImmediateCleanupCollector, RecoveryCleanupWorkCollector};
use crate::fs::{EphemeralFileSystem, FileSystem};
use crate::page_cache::PageCache;
use crate::tree::{DynLayout, GBPTree, SimpleLongLayout};
use crate::wal::{
    InMemoryChannel, LogEntry, LogEntryError, LogEntryVersion, LogEntryWriter, ReadableChannel,
    TransactionAppender, VersionAwareLogEntryReader,
};

pub const PAGE_SIZE: usize = 256;
pub const TREE_PATH: &str = "/tree.db";
pub const LOG_PATH: &str = "/tx.log";

/// A tree file on an in-memory file system that can be crashed.
pub struct TestStore {
    pub fs: Arc<EphemeralFileSystem>,
    pub page_cache: PageCache,
}

impl TestStore {
    #[must_use]
    pub fn new() -> Self {
        let fs = Arc::new(EphemeralFileSystem::new());
        let dyn_fs: Arc<dyn FileSystem> = Arc::clone(&fs) as Arc<dyn FileSystem>;
        Self {
            fs,
            page_cache: PageCache::new(dyn_fs, 64),
        }
    }

    #[must_use]
    pub fn tree_path(&self) -> &'static Path {
        Path::new(TREE_PATH)
    }

    /// Create or open the tree, cleaning up after a crash right away.
    #[must_use]
    pub fn open_tree(&self) -> GBPTree<SimpleLongLayout> {
        self.open_tree_with(Arc::new(ImmediateCleanupCollector))
    }

    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn open_tree_with(
        &self,
        collector: Arc<dyn RecoveryCleanupWorkCollector>,
    ) -> GBPTree<SimpleLongLayout> {
        GBPTree::builder(&self.page_cache, TREE_PATH, SimpleLongLayout)
            .page_size(PAGE_SIZE)
            .cleanup_collector(collector)
            .build()
            .expect("Failed to open tree")
    }

    /// Read-only bootstrap of the tree file.
    #[must_use]
    pub fn bootstrap(&self) -> Bootstrap {
        GBPTreeBootstrapper::new(
            self.page_cache.clone(),
            Arc::new(DefaultLayoutBootstrapper::default()),
        )
        .bootstrap_tree(TREE_PATH)
    }

    /// Drop everything written since the last sync.
    #[allow(clippy::expect_used)]
    pub fn crash(&self) {
        self.fs.crash().expect("Failed to simulate crash");
    }
}

/// Insert `key => key * 10` for every key in `keys`.
#[allow(clippy::expect_used)]
pub fn insert_range(tree: &GBPTree<SimpleLongLayout>, keys: Range<u64>) {
    for key in keys {
        tree.insert(&key, &(key * 10)).expect("Failed to insert");
    }
}

/// Every key in the tree, in scan order.
#[allow(clippy::expect_used)]
pub fn keys(tree: &GBPTree<SimpleLongLayout>) -> Vec<u64> {
    tree.seek_all()
        .expect("Failed to seek")
        .map(|entry| entry.expect("Failed to read entry").0)
        .collect()
}

/// Every key of a bootstrapped tree, decoded as big-endian `u64`.
#[allow(clippy::expect_used)]
pub fn bootstrapped_keys(tree: &GBPTree<DynLayout>) -> Vec<u64> {
    let mut cursor = tree.seek_raw(None, None).expect("Failed to seek");
    let mut keys = Vec::new();
    while let Some(entry) = cursor.next_raw().expect("Failed to read entry") {
        let bytes: [u8; 8] = entry.key.as_slice().try_into().expect("Key is not 8 bytes");
        keys.push(u64::from_be_bytes(bytes));
    }
    keys
}

/// An appender writing V2 entries into memory.
#[must_use]
pub fn memory_log() -> TransactionAppender<InMemoryChannel> {
    TransactionAppender::new(LogEntryWriter::new(InMemoryChannel::new(), LogEntryVersion::V2))
}

/// Read entries until the end of the log or the first error.
pub fn read_until_error<C: ReadableChannel>(
    reader: &mut VersionAwareLogEntryReader<C>,
) -> (Vec<LogEntry>, Option<LogEntryError>) {
    let mut entries = Vec::new();
    loop {
        match reader.read_log_entry() {
            Ok(Some(entry)) => entries.push(entry),
            Ok(None) => return (entries, None),
            Err(err) => return (entries, Some(err)),
        }
    }
}

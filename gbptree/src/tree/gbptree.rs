//! The tree facade: creating, opening, mutating, checkpointing and closing
//! a GBPTree file.
//!
//! # File layout
//!
//! - Page 0: meta record
//! - Pages 1 and 2: tree state slots A and B
//! - Pages 3 and up: tree nodes and free-list pages
//!
//! # Generations
//!
//! A tree runs under a stable generation (the last checkpoint) and an
//! unstable one (everything written since). A writable open persists a
//! state with a raised unstable generation before anything else is written,
//! which turns whatever an earlier crashed session wrote into a crashed
//! generation. A checkpoint flushes every page, then writes the slot not
//! holding the newest state, then syncs that slot.
//!
//! # Concurrency
//!
//! Any number of threads may read through [`GBPTree::get`] and
//! [`GBPTree::seek`] while one writer mutates; mutating calls are
//! serialized on an internal lock.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::collector::{ImmediateCleanupCollector, RecoveryCleanupWorkCollector};
use crate::config::TreeConfig;
use crate::failpoint;
use crate::page_cache::{MapOptions, NULL_PAGE_ID, PageCache, PageId, PagedFile, PinMode};
use crate::tree::cleanup::{CleanupReport, CrashGenerationCleaner};
use crate::tree::consistency::ConsistencyReport;
use crate::tree::error::{GBPTreeError, ReadOnlyViolation};
use crate::tree::freelist::FreeList;
use crate::tree::header::{HeaderReader, HeaderUpdate};
use crate::tree::layout::Layout;
use crate::tree::meta::Meta;
use crate::tree::monitor::{Monitor, NoMonitor};
use crate::tree::node::{self, ChildPointer, LeafNode, Node, NodeBody, NodeHeader};
use crate::tree::pointer::Generation;
use crate::tree::seek::{SeekCursor, StructureLatch};
use crate::tree::state::{
    BASE_PAGE_ID, META_PAGE_ID, STATE_VERSION, StateError, StateSlot, TreeState, TreeStatePair,
};
use crate::tree::writer::Mutation;

/// Generation of a freshly created tree.
const INITIAL_GENERATION: Generation = Generation::new(1, 2);

/// What readers need to start a descent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RootSnapshot {
    pub(crate) root: ChildPointer,
    pub(crate) generation: Generation,
}

/// State owned by the writer.
#[derive(Debug)]
pub(crate) struct WriterState {
    pub(crate) free_list: FreeList,
    header: Vec<u8>,
    /// Slot holding the newest persisted state.
    active_slot: StateSlot,
}

/// Shared tree internals. Readers, the crash cleaner and the facade all
/// hold it through an `Arc`.
pub(crate) struct TreeCore<L: Layout> {
    pub(crate) layout: L,
    pub(crate) paged_file: Arc<PagedFile>,
    pub(crate) meta: Meta,
    read_only: bool,
    pub(crate) root: RwLock<RootSnapshot>,
    pub(crate) latch: StructureLatch,
    writer: Mutex<WriterState>,
    pub(crate) cleanup_pending: AtomicBool,
    /// Set when a change failed after writing some of its pages.
    write_failed: AtomicBool,
    closed: AtomicBool,
    pub(crate) monitor: Arc<dyn Monitor>,
    pub(crate) seek_max_retries: u32,
}

impl<L: Layout> TreeCore<L> {
    pub(crate) const fn page_size(&self) -> usize {
        self.meta.page_size
    }

    pub(crate) fn snapshot(&self) -> Result<RootSnapshot, GBPTreeError> {
        self.root
            .read()
            .map(|root| *root)
            .map_err(|_| GBPTreeError::LockPoisoned)
    }

    pub(crate) fn lock_writer(&self) -> Result<MutexGuard<'_, WriterState>, GBPTreeError> {
        self.writer.lock().map_err(|_| GBPTreeError::LockPoisoned)
    }

    /// Read and decode a tree node.
    pub(crate) fn read_node(&self, id: PageId) -> Result<Node, GBPTreeError> {
        if id < BASE_PAGE_ID {
            return Err(GBPTreeError::corrupt(id, "pointer into the file header"));
        }
        let cursor = self.paged_file.pin(id, PinMode::Read)?;
        Node::read_from(cursor.page()).map_err(|e| GBPTreeError::node(id, &e))
    }

    pub(crate) fn ensure_open(&self) -> Result<(), GBPTreeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GBPTreeError::Closed);
        }
        Ok(())
    }

    fn ensure_writable(&self, operation: &'static str) -> Result<(), GBPTreeError> {
        self.ensure_open()?;
        if self.read_only {
            return Err(ReadOnlyViolation { operation }.into());
        }
        if self.write_failed.load(Ordering::Acquire) {
            return Err(GBPTreeError::WriteFailed);
        }
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)] // u16::MAX fits in usize
    fn check_entry(&self, key: &[u8], value: &[u8]) -> Result<(), GBPTreeError> {
        let page_size = self.page_size();
        let max_key_size = node::max_key_size(page_size).min(u16::MAX as usize);
        let max_entry_size = node::max_entry_size(page_size);
        let entry_size = node::leaf_entry_size(key.len(), value.len());
        if key.len() > max_key_size
            || entry_size > max_entry_size
            || value.len() > u16::MAX as usize
        {
            return Err(GBPTreeError::EntryTooLarge {
                key_size: key.len(),
                entry_size,
                max_key_size,
                max_entry_size,
            });
        }
        Ok(())
    }

    pub(crate) fn insert_raw(&self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>, GBPTreeError> {
        self.ensure_writable("insert")?;
        self.check_entry(key, value)?;
        self.mutate(|mutation| mutation.insert(key, value))
    }

    pub(crate) fn remove_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>, GBPTreeError> {
        self.ensure_writable("remove")?;
        self.mutate(|mutation| mutation.remove(key))
    }

    /// Run one structural change under the writer lock and publish it.
    /// On failure the free list is restored so no page id leaks into both
    /// the tree and the free list. A failure while writing pages leaves
    /// the unstable generation half written, so the tree refuses further
    /// writes until it is reopened and cleaned like after a crash.
    fn mutate<T, F>(&self, change: F) -> Result<T, GBPTreeError>
    where
        F: FnOnce(&mut Mutation<'_, L>) -> Result<T, GBPTreeError>,
    {
        let mut writer = self.lock_writer()?;
        let snapshot = self.snapshot()?;
        let saved = writer.free_list.clone();
        let mut committing = false;
        let result = {
            let mut mutation = Mutation::new(self, &mut writer.free_list, snapshot);
            change(&mut mutation).and_then(|value| {
                if mutation.is_dirty() {
                    committing = true;
                    mutation.commit()?;
                }
                Ok(value)
            })
        };
        if let Err(e) = &result {
            writer.free_list = saved;
            if committing {
                self.write_failed.store(true, Ordering::Release);
                tracing::error!(
                    path = %self.paged_file.path().display(),
                    error = %e,
                    "tree change failed part way; writes refused until reopened"
                );
            }
        }
        result
    }

    /// Make everything written so far durable and start a new generation.
    pub(crate) fn checkpoint(&self, update: HeaderUpdate<'_>, clean: bool) -> Result<(), GBPTreeError> {
        self.ensure_writable("checkpoint")?;
        if self.cleanup_pending.load(Ordering::Acquire) {
            return Err(GBPTreeError::CleanupPending);
        }
        let mut writer = self.lock_writer()?;
        let header = match update {
            HeaderUpdate::CarryOver => writer.header.clone(),
            HeaderUpdate::Replace(data) => {
                let max = TreeState::max_header_size(self.page_size());
                if data.len() > max {
                    return Err(GBPTreeError::HeaderTooLarge {
                        size: data.len(),
                        max,
                    });
                }
                data.to_vec()
            }
        };

        let snapshot = self.snapshot()?;
        let generation = snapshot.generation;
        let free_list_head = writer.free_list.persist(&self.paged_file, generation)?;
        let pages_flushed = self.paged_file.flush_and_force()?;
        failpoint::maybe_fail(failpoint::CHECKPOINT_BEFORE_STATE_WRITE)?;

        let slot = writer.active_slot.other();
        let state = TreeState {
            slot,
            stable_generation: generation.unstable,
            unstable_generation: generation.unstable + 1,
            root_id: snapshot.root.id,
            root_generation: snapshot.root.generation,
            last_id: writer.free_list.last_id(),
            free_list_head,
            free_list_count: writer.free_list.len() as u64,
            clean,
            version: STATE_VERSION,
        };
        write_state(&self.paged_file, &state, &header)?;
        failpoint::maybe_fail(failpoint::CHECKPOINT_BEFORE_STATE_SYNC)?;
        self.paged_file.flush_pages(&[slot.page_id()])?;

        writer.active_slot = slot;
        writer.header = header;
        let next = generation.next_checkpoint();
        {
            let _guard = self.latch.write();
            let mut root = self.root.write().map_err(|_| GBPTreeError::LockPoisoned)?;
            root.generation = next;
        }
        drop(writer);

        tracing::debug!(
            path = %self.paged_file.path().display(),
            stable = next.stable,
            pages_flushed,
            free_pages = state.free_list_count,
            slot = %slot,
            "checkpoint written"
        );
        self.monitor.checkpoint_completed(next, pages_flushed);
        Ok(())
    }

    /// Checkpoint as clean (unless read-only or cleanup is pending), then
    /// release the mapping. Idempotent.
    pub(crate) fn close(&self) -> Result<(), GBPTreeError> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let result = if self.read_only {
            Ok(())
        } else if self.cleanup_pending.load(Ordering::Acquire) {
            tracing::warn!(
                path = %self.paged_file.path().display(),
                "closing with crash cleanup pending; changes since the last checkpoint are dropped"
            );
            Ok(())
        } else if self.write_failed.load(Ordering::Acquire) {
            tracing::warn!(
                path = %self.paged_file.path().display(),
                "closing after a failed change; changes since the last checkpoint are dropped"
            );
            Ok(())
        } else {
            self.checkpoint(HeaderUpdate::CarryOver, true)
        };
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.paged_file.close();
        }
        result
    }

    fn header_data(&self) -> Result<Vec<u8>, GBPTreeError> {
        Ok(self.lock_writer()?.header.clone())
    }
}

impl<L: Layout> std::fmt::Debug for TreeCore<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeCore")
            .field("path", &self.paged_file.path())
            .field("meta", &self.meta)
            .field("read_only", &self.read_only)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn write_state(paged_file: &PagedFile, state: &TreeState, header: &[u8]) -> Result<(), GBPTreeError> {
    let page_id = state.slot.page_id();
    let mut cursor = paged_file.pin(page_id, PinMode::Overwrite)?;
    state
        .write_to_page(cursor.page_mut(), header)
        .map_err(|e| match e {
            StateError::HeaderTooLarge { size, max } => GBPTreeError::HeaderTooLarge { size, max },
            other => GBPTreeError::corrupt(page_id, other),
        })?;
    cursor.commit()?;
    Ok(())
}

/// A crash-safe B+tree over a single paged file.
///
/// Dropping a tree without [`GBPTree::close`] behaves like a crash: nothing
/// since the last checkpoint is made durable.
pub struct GBPTree<L: Layout> {
    core: Arc<TreeCore<L>>,
}

impl<L: Layout> GBPTree<L> {
    /// Start building a tree on `path`. The file is created if it does not
    /// exist.
    pub fn builder(page_cache: &PageCache, path: impl AsRef<Path>, layout: L) -> GBPTreeBuilder<L> {
        GBPTreeBuilder::new(page_cache.clone(), path.as_ref().to_path_buf(), layout)
    }

    fn encode_key(&self, key: &L::Key) -> Vec<u8> {
        let mut out = Vec::new();
        self.core.layout.write_key(key, &mut out);
        out
    }

    fn encode_value(&self, value: &L::Value) -> Vec<u8> {
        let mut out = Vec::new();
        self.core.layout.write_value(value, &mut out);
        out
    }

    fn decode_value(&self, bytes: Option<Vec<u8>>) -> Result<Option<L::Value>, GBPTreeError> {
        bytes
            .map(|bytes| self.core.layout.read_value(&bytes))
            .transpose()
            .map_err(GBPTreeError::from)
    }

    /// Insert or replace. Returns the replaced value.
    pub fn insert(&self, key: &L::Key, value: &L::Value) -> Result<Option<L::Value>, GBPTreeError> {
        let old = self.insert_raw(&self.encode_key(key), &self.encode_value(value))?;
        self.decode_value(old)
    }

    /// Remove a key. Returns the removed value.
    pub fn remove(&self, key: &L::Key) -> Result<Option<L::Value>, GBPTreeError> {
        let old = self.remove_raw(&self.encode_key(key))?;
        self.decode_value(old)
    }

    pub fn get(&self, key: &L::Key) -> Result<Option<L::Value>, GBPTreeError> {
        let value = self.get_raw(&self.encode_key(key))?;
        self.decode_value(value)
    }

    /// Insert an already encoded entry.
    pub fn insert_raw(&self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>, GBPTreeError> {
        self.core.insert_raw(key, value)
    }

    pub fn remove_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>, GBPTreeError> {
        self.core.remove_raw(key)
    }

    pub fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>, GBPTreeError> {
        self.core.get_raw(key)
    }

    /// Entries with `from <= key < to`, in key order.
    pub fn seek(&self, from: &L::Key, to: &L::Key) -> Result<SeekCursor<L>, GBPTreeError> {
        self.seek_raw(Some(self.encode_key(from)), Some(self.encode_key(to)))
    }

    /// Every entry, in key order.
    pub fn seek_all(&self) -> Result<SeekCursor<L>, GBPTreeError> {
        self.seek_raw(None, None)
    }

    /// Seek over encoded bounds. `None` leaves that side unbounded.
    pub fn seek_raw(
        &self,
        from: Option<Vec<u8>>,
        to: Option<Vec<u8>>,
    ) -> Result<SeekCursor<L>, GBPTreeError> {
        self.core.ensure_open()?;
        Ok(SeekCursor::new(Arc::clone(&self.core), from, to))
    }

    /// Number of entries, counted by a full scan.
    pub fn count_entries(&self) -> Result<u64, GBPTreeError> {
        let mut cursor = self.seek_all()?;
        let mut count = 0;
        while cursor.next_raw()?.is_some() {
            count += 1;
        }
        Ok(count)
    }

    /// Walk the whole tree and report structural problems.
    pub fn check_consistency(&self) -> Result<ConsistencyReport, GBPTreeError> {
        self.core.ensure_open()?;
        self.core.check_consistency()
    }

    /// Run the crash generation cleanup on the calling thread. A no-op
    /// report when no cleanup is pending.
    pub fn clean_crashed(&self) -> Result<CleanupReport, GBPTreeError> {
        self.core.ensure_writable("clean crashed")?;
        self.core.clean_crashed()
    }

    pub fn checkpoint(&self, header: HeaderUpdate<'_>) -> Result<(), GBPTreeError> {
        self.core.checkpoint(header, false)
    }

    /// Checkpoint and release the file. Further calls return `Closed`;
    /// closing again is a no-op.
    pub fn close(&self) -> Result<(), GBPTreeError> {
        self.core.close()
    }

    #[must_use]
    pub fn layout(&self) -> &L {
        &self.core.layout
    }

    #[must_use]
    pub fn meta(&self) -> Meta {
        self.core.meta
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.core.paged_file.path()
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.core.read_only
    }

    /// Whether crash cleanup must run before the next checkpoint.
    #[must_use]
    pub fn cleanup_pending(&self) -> bool {
        self.core.cleanup_pending.load(Ordering::Acquire)
    }

    pub fn generation(&self) -> Result<Generation, GBPTreeError> {
        Ok(self.core.snapshot()?.generation)
    }

    /// Header data stored with the last checkpoint.
    pub fn header_data(&self) -> Result<Vec<u8>, GBPTreeError> {
        self.core.header_data()
    }

    #[must_use]
    pub fn max_key_size(&self) -> usize {
        node::max_key_size(self.core.page_size())
    }

    #[must_use]
    pub fn max_entry_size(&self) -> usize {
        node::max_entry_size(self.core.page_size())
    }
}

impl<L: Layout> std::fmt::Debug for GBPTree<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GBPTree").field("core", &self.core).finish()
    }
}

/// Options for creating or opening a tree.
pub struct GBPTreeBuilder<L: Layout> {
    page_cache: PageCache,
    path: PathBuf,
    layout: L,
    page_size: usize,
    header_reader: Option<HeaderReader>,
    initial_header: Vec<u8>,
    cleanup_collector: Arc<dyn RecoveryCleanupWorkCollector>,
    read_only: bool,
    monitor: Arc<dyn Monitor>,
    seek_max_retries: u32,
}

impl<L: Layout> GBPTreeBuilder<L> {
    fn new(page_cache: PageCache, path: PathBuf, layout: L) -> Self {
        Self {
            page_cache,
            path,
            layout,
            page_size: TreeConfig::DEFAULT_PAGE_SIZE,
            header_reader: None,
            initial_header: Vec::new(),
            cleanup_collector: Arc::new(ImmediateCleanupCollector),
            read_only: false,
            monitor: Arc::new(NoMonitor),
            seek_max_retries: TreeConfig::DEFAULT_SEEK_MAX_RETRIES,
        }
    }

    /// Page size of a newly created file. Existing files keep theirs.
    #[must_use]
    pub const fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Called with the stored header data when an existing file is opened.
    #[must_use]
    pub fn header_reader(mut self, reader: impl FnOnce(&[u8]) + Send + 'static) -> Self {
        self.header_reader = Some(Box::new(reader));
        self
    }

    /// Header data written when the file is created.
    #[must_use]
    pub fn header_writer(mut self, header: &[u8]) -> Self {
        self.initial_header = header.to_vec();
        self
    }

    #[must_use]
    pub fn cleanup_collector(mut self, collector: Arc<dyn RecoveryCleanupWorkCollector>) -> Self {
        self.cleanup_collector = collector;
        self
    }

    #[must_use]
    pub const fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    #[must_use]
    pub fn monitor(mut self, monitor: Arc<dyn Monitor>) -> Self {
        self.monitor = monitor;
        self
    }

    #[must_use]
    pub const fn seek_max_retries(mut self, retries: u32) -> Self {
        self.seek_max_retries = retries;
        self
    }

    /// Take page size, read-only flag and seek retries from a configuration.
    #[must_use]
    pub const fn config(mut self, config: &TreeConfig) -> Self {
        self.page_size = config.page_size;
        self.read_only = config.read_only;
        self.seek_max_retries = config.seek_max_retries;
        self
    }

    /// Create or open the tree.
    pub fn build(self) -> Result<GBPTree<L>, GBPTreeError> {
        let fs = Arc::clone(self.page_cache.file_system());
        let exists = fs.exists(&self.path) && fs.file_size(&self.path)? > 0;

        let paged_file = if exists {
            let meta = Meta::read_from_file(fs.as_ref(), &self.path)?;
            meta.check_layout(&self.layout)?;
            let options = if self.read_only {
                MapOptions::read_only()
            } else {
                MapOptions::default()
            };
            self.page_cache.map(&self.path, meta.page_size, options)?
        } else {
            if self.read_only {
                return Err(GBPTreeError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{} does not exist", self.path.display()),
                )));
            }
            let paged_file = self
                .page_cache
                .map(&self.path, self.page_size, MapOptions::create())?;
            let meta = Meta::for_layout(&self.layout, self.page_size);
            create_tree(&paged_file, &meta, &self.initial_header)?;
            tracing::info!(
                path = %self.path.display(),
                page_size = self.page_size,
                layout = meta.layout_identifier,
                "created tree"
            );
            paged_file
        };
        self.open(paged_file)
    }

    fn open(self, paged_file: Arc<PagedFile>) -> Result<GBPTree<L>, GBPTreeError> {
        let meta = {
            let cursor = paged_file.pin(META_PAGE_ID, PinMode::Read)?;
            Meta::from_page(cursor.page())?
        };
        meta.check_layout(&self.layout)?;

        let pair = TreeStatePair::read(&paged_file);
        let selected = pair.select_newest()?.clone();
        let state = selected.state;
        let generation = Generation::new(state.stable_generation, state.unstable_generation + 1);
        let free_list = FreeList::load(
            &paged_file,
            state.free_list_head,
            state.free_list_count,
            state.last_id,
        )?;
        if let Some(reader) = self.header_reader {
            reader(&selected.header);
        }

        let mut active_slot = state.slot;
        if !self.read_only {
            // Raise the unstable generation on disk before anything else
            // is written in it.
            let dirty = TreeState {
                slot: state.slot.other(),
                unstable_generation: generation.unstable,
                clean: false,
                ..state
            };
            write_state(&paged_file, &dirty, &selected.header)?;
            paged_file.flush_pages(&[dirty.slot.page_id()])?;
            active_slot = dirty.slot;
        }

        tracing::info!(
            path = %paged_file.path().display(),
            page_size = meta.page_size,
            clean = state.clean,
            stable = generation.stable,
            unstable = generation.unstable,
            read_only = self.read_only,
            "opened tree"
        );
        self.monitor
            .startup_state(paged_file.path(), state.clean, generation);

        let needs_cleanup = !self.read_only && !state.clean;
        let core = Arc::new(TreeCore {
            layout: self.layout,
            paged_file,
            meta,
            read_only: self.read_only,
            root: RwLock::new(RootSnapshot {
                root: ChildPointer::new(state.root_id, state.root_generation),
                generation,
            }),
            latch: StructureLatch::default(),
            writer: Mutex::new(WriterState {
                free_list,
                header: selected.header,
                active_slot,
            }),
            cleanup_pending: AtomicBool::new(needs_cleanup),
            write_failed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            monitor: self.monitor,
            seek_max_retries: self.seek_max_retries,
        });

        if needs_cleanup {
            let job = CrashGenerationCleaner::new(Arc::downgrade(&core));
            core.monitor.cleanup_registered();
            self.cleanup_collector.add(Arc::new(job));
        }
        Ok(GBPTree { core })
    }
}

impl<L: Layout> std::fmt::Debug for GBPTreeBuilder<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GBPTreeBuilder")
            .field("path", &self.path)
            .field("page_size", &self.page_size)
            .field("read_only", &self.read_only)
            .field("cleanup_collector", &self.cleanup_collector)
            .finish_non_exhaustive()
    }
}

/// Write meta, an empty root leaf and state slot A, then sync.
fn create_tree(paged_file: &PagedFile, meta: &Meta, header: &[u8]) -> Result<(), GBPTreeError> {
    {
        let mut cursor = paged_file.pin(META_PAGE_ID, PinMode::Overwrite)?;
        meta.write_to_page(cursor.page_mut());
        cursor.commit()?;
    }
    {
        let root = Node {
            header: NodeHeader::fresh(INITIAL_GENERATION.stable, None, None),
            body: NodeBody::Leaf(LeafNode::default()),
        };
        let mut cursor = paged_file.pin(BASE_PAGE_ID, PinMode::Overwrite)?;
        root.write_to(cursor.page_mut());
        cursor.commit()?;
    }
    let state = TreeState {
        slot: StateSlot::A,
        stable_generation: INITIAL_GENERATION.stable,
        unstable_generation: INITIAL_GENERATION.unstable,
        root_id: BASE_PAGE_ID,
        root_generation: INITIAL_GENERATION.stable,
        last_id: BASE_PAGE_ID,
        free_list_head: NULL_PAGE_ID,
        free_list_count: 0,
        clean: true,
        version: STATE_VERSION,
    };
    write_state(paged_file, &state, header)?;
    paged_file.flush_and_force()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::IgnoreCleanupCollector;
    use crate::fs::{EphemeralFileSystem, FileSystem};
    use crate::tree::TreeInconsistency;
    use crate::tree::layout::{ByteLayout, SimpleLongLayout};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;

    const PAGE_SIZE: usize = 256;

    fn setup() -> (Arc<EphemeralFileSystem>, PageCache) {
        let fs = Arc::new(EphemeralFileSystem::new());
        let dyn_fs: Arc<dyn FileSystem> = fs.clone();
        (fs, PageCache::new(dyn_fs, 64))
    }

    fn open(cache: &PageCache) -> GBPTree<SimpleLongLayout> {
        GBPTree::builder(cache, "/tree", SimpleLongLayout)
            .page_size(PAGE_SIZE)
            .build()
            .expect("build tree")
    }

    fn all(tree: &GBPTree<SimpleLongLayout>) -> Vec<(u64, u64)> {
        tree.seek_all()
            .expect("seek")
            .collect::<Result<Vec<_>, _>>()
            .expect("scan")
    }

    fn assert_consistent<L: Layout>(tree: &GBPTree<L>) -> ConsistencyReport {
        let report = tree.check_consistency().expect("check");
        assert!(report.is_consistent(), "violations: {:?}", report.violations);
        report
    }

    #[test]
    fn test_new_tree_is_empty() {
        let (_fs, cache) = setup();
        let tree = open(&cache);
        assert_eq!(tree.get(&1).expect("get"), None);
        assert_eq!(tree.count_entries().expect("count"), 0);
        let report = assert_consistent(&tree);
        assert_eq!(report.depth, 1);
        assert_eq!(tree.generation().expect("gen"), Generation::new(1, 3));
    }

    #[test]
    fn test_insert_get_replace_remove() {
        let (_fs, cache) = setup();
        let tree = open(&cache);
        assert_eq!(tree.insert(&5, &50).expect("insert"), None);
        assert_eq!(tree.insert(&5, &55).expect("replace"), Some(50));
        assert_eq!(tree.get(&5).expect("get"), Some(55));
        assert_eq!(tree.remove(&5).expect("remove"), Some(55));
        assert_eq!(tree.remove(&5).expect("remove again"), None);
        assert_eq!(tree.get(&5).expect("get"), None);
    }

    #[test]
    fn test_sequential_inserts_split_and_stay_ordered() {
        let (_fs, cache) = setup();
        let tree = open(&cache);
        for key in 0..500 {
            tree.insert(&key, &(key * 10)).expect("insert");
        }
        let report = assert_consistent(&tree);
        assert_eq!(report.entries, 500);
        assert!(report.depth > 2, "expected a multi-level tree");

        let entries = all(&tree);
        assert_eq!(entries.len(), 500);
        assert!(entries.iter().enumerate().all(|(i, (k, v))| *k == i as u64 && *v == k * 10));
    }

    #[test]
    fn test_seek_range_is_half_open() {
        let (_fs, cache) = setup();
        let tree = open(&cache);
        for key in (0..200).rev() {
            tree.insert(&key, &key).expect("insert");
        }
        let keys: Vec<u64> = tree
            .seek(&17, &42)
            .expect("seek")
            .map(|entry| entry.expect("entry").0)
            .collect();
        assert_eq!(keys, (17..42).collect::<Vec<_>>());
        assert_eq!(tree.seek(&42, &17).expect("seek").count(), 0);
        assert_eq!(tree.seek(&500, &600).expect("seek").count(), 0);
    }

    #[test]
    fn test_removing_everything_collapses_the_tree() {
        let (_fs, cache) = setup();
        let tree = open(&cache);
        for key in 0..300 {
            tree.insert(&key, &key).expect("insert");
        }
        tree.checkpoint(HeaderUpdate::CarryOver).expect("checkpoint");
        for key in 0..300 {
            assert_eq!(tree.remove(&key).expect("remove"), Some(key));
        }
        let report = assert_consistent(&tree);
        assert_eq!(report.entries, 0);
        assert_eq!(report.depth, 1);
        assert!(report.free_pages > 0);
    }

    #[test]
    fn test_random_workload_matches_btreemap() {
        let (_fs, cache) = setup();
        let tree = open(&cache);
        let mut model = BTreeMap::new();
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for round in 0..3000 {
            let key = rng.random_range(0..400u64);
            if rng.random_bool(0.6) {
                let value = rng.random::<u64>();
                assert_eq!(
                    tree.insert(&key, &value).expect("insert"),
                    model.insert(key, value)
                );
            } else {
                assert_eq!(tree.remove(&key).expect("remove"), model.remove(&key));
            }
            if round % 500 == 499 {
                tree.checkpoint(HeaderUpdate::CarryOver).expect("checkpoint");
                assert_consistent(&tree);
            }
        }

        let expected: Vec<(u64, u64)> = model.iter().map(|(k, v)| (*k, *v)).collect();
        assert_eq!(all(&tree), expected);
        assert_eq!(assert_consistent(&tree).entries, model.len() as u64);
        for key in 0..400 {
            assert_eq!(tree.get(&key).expect("get"), model.get(&key).copied());
        }
    }

    #[test]
    fn test_variable_size_entries() {
        let (_fs, cache) = setup();
        let tree = GBPTree::builder(&cache, "/bytes", ByteLayout::raw())
            .page_size(PAGE_SIZE)
            .build()
            .expect("build");
        let mut model = BTreeMap::new();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1500 {
            let key_len = rng.random_range(1..=tree.max_key_size());
            let key: Vec<u8> = (0..key_len).map(|_| rng.random_range(b'a'..=b'd')).collect();
            if rng.random_bool(0.7) {
                let room = tree.max_entry_size() - node::leaf_entry_size(key.len(), 0);
                let value = vec![rng.random::<u8>(); rng.random_range(0..=room)];
                assert_eq!(tree.insert(&key, &value).expect("insert"), model.insert(key, value));
            } else {
                assert_eq!(tree.remove(&key).expect("remove"), model.remove(&key));
            }
        }
        let scanned: Vec<(Vec<u8>, Vec<u8>)> = tree
            .seek_all()
            .expect("seek")
            .collect::<Result<_, _>>()
            .expect("scan");
        let expected: Vec<(Vec<u8>, Vec<u8>)> = model.into_iter().collect();
        assert_eq!(scanned, expected);
        assert_consistent(&tree);
    }

    #[test]
    fn test_entry_too_large_is_rejected() {
        let (_fs, cache) = setup();
        let tree = GBPTree::builder(&cache, "/bytes", ByteLayout::raw())
            .page_size(PAGE_SIZE)
            .build()
            .expect("build");
        let key = vec![1u8; tree.max_key_size() + 1];
        assert!(matches!(
            tree.insert(&key, &Vec::new()),
            Err(GBPTreeError::EntryTooLarge { .. })
        ));
        let value = vec![1u8; tree.max_entry_size()];
        assert!(matches!(
            tree.insert(&vec![1], &value),
            Err(GBPTreeError::EntryTooLarge { .. })
        ));
        assert_eq!(tree.count_entries().expect("count"), 0);
    }

    #[test]
    fn test_close_then_reopen_keeps_entries_and_header() {
        let (_fs, cache) = setup();
        {
            let tree = GBPTree::builder(&cache, "/tree", SimpleLongLayout)
                .page_size(PAGE_SIZE)
                .header_writer(b"v1")
                .build()
                .expect("build");
            for key in 0..100 {
                tree.insert(&key, &(key + 1)).expect("insert");
            }
            tree.checkpoint(HeaderUpdate::Replace(b"v2")).expect("checkpoint");
            tree.close().expect("close");
            tree.close().expect("close is idempotent");
            assert!(matches!(tree.get(&1), Err(GBPTreeError::Closed)));
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let tree = GBPTree::builder(&cache, "/tree", SimpleLongLayout)
            .header_reader(move |data| sink.lock().expect("lock").extend_from_slice(data))
            .build()
            .expect("reopen");
        assert_eq!(seen.lock().expect("lock").as_slice(), b"v2");
        assert!(!tree.cleanup_pending());
        assert_eq!(tree.meta().page_size, PAGE_SIZE);
        assert_eq!(tree.count_entries().expect("count"), 100);
        assert_eq!(tree.get(&42).expect("get"), Some(43));
        assert_consistent(&tree);
    }

    #[test]
    fn test_header_too_large() {
        let (_fs, cache) = setup();
        let tree = open(&cache);
        let header = vec![0u8; TreeState::max_header_size(PAGE_SIZE) + 1];
        assert!(matches!(
            tree.checkpoint(HeaderUpdate::Replace(&header)),
            Err(GBPTreeError::HeaderTooLarge { .. })
        ));
        let header = vec![7u8; TreeState::max_header_size(PAGE_SIZE)];
        tree.checkpoint(HeaderUpdate::Replace(&header)).expect("fits");
        assert_eq!(tree.header_data().expect("header"), header);
    }

    #[test]
    fn test_read_only_rejects_mutation() {
        let (_fs, cache) = setup();
        {
            let tree = open(&cache);
            tree.insert(&1, &1).expect("insert");
            tree.close().expect("close");
        }
        let tree = GBPTree::builder(&cache, "/tree", SimpleLongLayout)
            .read_only(true)
            .build()
            .expect("open read-only");
        assert!(tree.is_read_only());
        assert_eq!(tree.get(&1).expect("get"), Some(1));
        for result in [
            tree.insert(&2, &2).map(|_| ()),
            tree.remove(&1).map(|_| ()),
            tree.checkpoint(HeaderUpdate::CarryOver),
        ] {
            assert!(matches!(result, Err(GBPTreeError::ReadOnly(_))));
        }
        tree.close().expect("close read-only");
    }

    #[test]
    fn test_read_only_open_of_missing_file_fails() {
        let (_fs, cache) = setup();
        let result = GBPTree::builder(&cache, "/missing", SimpleLongLayout)
            .read_only(true)
            .build();
        assert!(matches!(result, Err(GBPTreeError::Io(_))));
    }

    #[test]
    fn test_layout_mismatch_is_an_inconsistency() {
        let (_fs, cache) = setup();
        open(&cache).close().expect("close");
        let result = GBPTree::builder(&cache, "/tree", ByteLayout::raw()).build();
        assert!(matches!(
            result,
            Err(GBPTreeError::TreeInconsistency(TreeInconsistency::MetaMismatch { .. }))
        ));
    }

    #[test]
    fn test_crash_loses_uncheckpointed_changes_and_registers_cleanup() {
        let (fs, cache) = setup();
        {
            let tree = open(&cache);
            for key in 0..50 {
                tree.insert(&key, &key).expect("insert");
            }
            tree.checkpoint(HeaderUpdate::CarryOver).expect("checkpoint");
            for key in 50..150 {
                tree.insert(&key, &key).expect("insert");
            }
            for key in 0..10 {
                tree.remove(&key).expect("remove");
            }
            // Dropped without close.
        }
        fs.crash().expect("crash");

        let tree = GBPTree::builder(&cache, "/tree", SimpleLongLayout)
            .cleanup_collector(Arc::new(IgnoreCleanupCollector))
            .build()
            .expect("reopen");
        assert!(tree.cleanup_pending());
        assert_eq!(all(&tree), (0..50).map(|k| (k, k)).collect::<Vec<_>>());
        assert!(matches!(
            tree.checkpoint(HeaderUpdate::CarryOver),
            Err(GBPTreeError::CleanupPending)
        ));

        tree.clean_crashed().expect("cleanup");
        assert!(!tree.cleanup_pending());
        tree.insert(&1000, &1).expect("insert after cleanup");
        tree.checkpoint(HeaderUpdate::CarryOver).expect("checkpoint");
        assert_consistent(&tree);
    }

    #[test]
    fn test_change_failing_between_page_writes_stops_writes_until_reopen() {
        let (_fs, cache) = setup();
        let tree = open(&cache);
        for key in 0..50 {
            tree.insert(&key, &key).expect("insert");
        }
        tree.checkpoint(HeaderUpdate::CarryOver).expect("checkpoint");
        for key in 50..60 {
            tree.insert(&key, &key).expect("insert");
        }

        failpoint::enable(failpoint::COMMIT_BETWEEN_PAGE_WRITES);
        let failed = (60..1000).find(|key| tree.insert(key, key).is_err());
        failpoint::disable(failpoint::COMMIT_BETWEEN_PAGE_WRITES);
        assert!(failed.is_some(), "no change wrote more than one page");

        assert!(matches!(tree.insert(&2000, &1), Err(GBPTreeError::WriteFailed)));
        assert!(matches!(tree.remove(&1), Err(GBPTreeError::WriteFailed)));
        assert!(matches!(
            tree.checkpoint(HeaderUpdate::CarryOver),
            Err(GBPTreeError::WriteFailed)
        ));
        tree.close().expect("close");

        let tree = open(&cache);
        assert!(!tree.cleanup_pending());
        assert_eq!(all(&tree), (0..50).map(|k| (k, k)).collect::<Vec<_>>());
        assert_consistent(&tree);
        tree.insert(&2000, &1).expect("insert after reopen");
        tree.checkpoint(HeaderUpdate::CarryOver).expect("checkpoint");
        tree.close().expect("close");
    }

    #[test]
    fn test_immediate_collector_cleans_on_open() {
        let (fs, cache) = setup();
        {
            let tree = open(&cache);
            for key in 0..40 {
                tree.insert(&key, &key).expect("insert");
            }
            tree.checkpoint(HeaderUpdate::CarryOver).expect("checkpoint");
            for key in 0..40 {
                tree.insert(&key, &(key + 1)).expect("overwrite");
            }
            // Data pages reach the disk, the state does not.
            tree.core.paged_file.flush_and_force().expect("flush");
        }
        fs.crash().expect("crash");

        let tree = open(&cache);
        assert!(!tree.cleanup_pending());
        assert_eq!(tree.get(&7).expect("get"), Some(7));
        assert_consistent(&tree);
        tree.close().expect("close");
    }
}

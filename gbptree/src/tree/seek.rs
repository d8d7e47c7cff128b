//! Optimistic reads: point lookups and range seeks.
//!
//! Readers never take the writer lock. Every structural change is published
//! inside a write section of the [`StructureLatch`]; a reader records the
//! latch version before descending and validates it after reading a leaf.
//! A changed version, or a node whose generation is newer than the pointer
//! that led to it, sends the reader back to the root. A seek restarts from
//! the last key it returned, so entries are never returned twice.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering, fence};
use std::time::Duration;

use rand::Rng;

use crate::page_cache::PageId;
use crate::tree::error::GBPTreeError;
use crate::tree::gbptree::TreeCore;
use crate::tree::layout::Layout;
use crate::tree::monitor::Monitor;
use crate::tree::node::{LeafEntry, Node, NodeBody};
use crate::tree::pointer::Generation;

/// Deepest tree a reader descends before reporting a pointer cycle.
pub(crate) const MAX_TREE_DEPTH: usize = 64;

const INITIAL_BACKOFF: Duration = Duration::from_micros(10);
const MAX_BACKOFF: Duration = Duration::from_millis(1);

/// Sequence latch around structural changes. Odd versions mean a writer is
/// publishing pages.
#[derive(Debug, Default)]
pub(crate) struct StructureLatch {
    version: AtomicU64,
}

impl StructureLatch {
    /// Version to validate against later, `None` while a write is underway.
    pub(crate) fn read_begin(&self) -> Option<u64> {
        let version = self.version.load(Ordering::Acquire);
        (version % 2 == 0).then_some(version)
    }

    /// Whether nothing was published since `version` was taken.
    pub(crate) fn validate(&self, version: u64) -> bool {
        fence(Ordering::Acquire);
        self.version.load(Ordering::Acquire) == version
    }

    pub(crate) fn write(&self) -> LatchWriteGuard<'_> {
        self.version.fetch_add(1, Ordering::AcqRel);
        LatchWriteGuard { latch: self }
    }
}

pub(crate) struct LatchWriteGuard<'a> {
    latch: &'a StructureLatch,
}

impl Drop for LatchWriteGuard<'_> {
    fn drop(&mut self) {
        self.latch.version.fetch_add(1, Ordering::Release);
    }
}

/// Outcome of one optimistic read attempt.
pub(crate) enum Attempt<T> {
    Done(T),
    Retry,
}

/// A leaf as seen by a reader, with what is needed to move right from it.
#[derive(Debug)]
pub(crate) struct LeafRead {
    pub(crate) entries: Vec<LeafEntry>,
    pub(crate) right: Option<PageId>,
    latch_version: u64,
    generation: Generation,
}

/// Bounded retry with exponential backoff and jitter.
#[derive(Debug)]
pub(crate) struct Backoff {
    attempts: u32,
    max_attempts: u32,
    delay: Duration,
}

impl Backoff {
    pub(crate) const fn new(max_attempts: u32) -> Self {
        Self {
            attempts: 0,
            max_attempts,
            delay: INITIAL_BACKOFF,
        }
    }

    /// Progress was made: the next retry starts over.
    pub(crate) const fn reset(&mut self) {
        self.attempts = 0;
        self.delay = INITIAL_BACKOFF;
    }

    pub(crate) fn retry(&mut self, monitor: &dyn Monitor) -> Result<(), GBPTreeError> {
        self.attempts += 1;
        if self.attempts > self.max_attempts {
            tracing::warn!(attempts = self.max_attempts, "seek retries exhausted");
            return Err(GBPTreeError::SeekRetriesExhausted {
                attempts: self.max_attempts,
            });
        }
        monitor.seek_retried(self.attempts);
        if self.attempts == 1 {
            std::thread::yield_now();
            return Ok(());
        }
        let jitter_cap = u64::try_from(self.delay.as_micros() / 2).unwrap_or(0);
        let jitter = Duration::from_micros(rand::rng().random_range(0..=jitter_cap));
        std::thread::sleep(self.delay + jitter);
        self.delay = (self.delay * 2).min(MAX_BACKOFF);
        Ok(())
    }
}

impl<L: Layout> TreeCore<L> {
    /// Descend to the leaf whose range holds `key`, or the leftmost leaf.
    pub(crate) fn try_find_leaf(
        &self,
        key: Option<&[u8]>,
    ) -> Result<Attempt<LeafRead>, GBPTreeError> {
        let Some(latch_version) = self.latch.read_begin() else {
            return Ok(Attempt::Retry);
        };
        let snapshot = self.snapshot()?;
        let mut pointer = snapshot.root;

        for _ in 0..MAX_TREE_DEPTH {
            let node = match self.read_node(pointer.id) {
                Ok(node) => node,
                Err(e) => return self.retry_or(latch_version, e),
            };
            if node.generation() > pointer.generation {
                return self.retry_or(
                    latch_version,
                    GBPTreeError::corrupt(pointer.id, "node is newer than the pointer to it"),
                );
            }
            let Node { header, body } = node;
            match body {
                NodeBody::Leaf(leaf) => {
                    let right = header.right_sibling.read(snapshot.generation);
                    if !self.latch.validate(latch_version) {
                        return Ok(Attempt::Retry);
                    }
                    return Ok(Attempt::Done(LeafRead {
                        entries: leaf.entries,
                        right,
                        latch_version,
                        generation: snapshot.generation,
                    }));
                }
                NodeBody::Internal(internal) => {
                    let index = key.map_or(0, |key| {
                        internal.find_child_index(key, |a, b| self.layout.compare(a, b))
                    });
                    match internal.children.get(index) {
                        Some(child) => pointer = *child,
                        None => {
                            return self.retry_or(
                                latch_version,
                                GBPTreeError::corrupt(pointer.id, "missing child pointer"),
                            );
                        }
                    }
                }
            }
        }
        self.retry_or(
            latch_version,
            GBPTreeError::corrupt(pointer.id, "tree depth exceeds the supported maximum"),
        )
    }

    /// Move to the right sibling of `from`. Only valid while nothing was
    /// published since `from` was read.
    pub(crate) fn try_read_right(
        &self,
        from: &LeafRead,
    ) -> Result<Attempt<Option<LeafRead>>, GBPTreeError> {
        let Some(right) = from.right else {
            return Ok(Attempt::Done(None));
        };
        if !self.latch.validate(from.latch_version) {
            return Ok(Attempt::Retry);
        }
        let node = match self.read_node(right) {
            Ok(node) => node,
            Err(e) => return self.retry_or(from.latch_version, e),
        };
        let Node { header, body } = node;
        let NodeBody::Leaf(leaf) = body else {
            return self.retry_or(
                from.latch_version,
                GBPTreeError::corrupt(right, "sibling of a leaf is not a leaf"),
            );
        };
        let next = header.right_sibling.read(from.generation);
        if !self.latch.validate(from.latch_version) {
            return Ok(Attempt::Retry);
        }
        Ok(Attempt::Done(Some(LeafRead {
            entries: leaf.entries,
            right: next,
            latch_version: from.latch_version,
            generation: from.generation,
        })))
    }

    /// An error seen while the latch was stable is real; otherwise the
    /// reader raced a writer and retries.
    fn retry_or<T>(
        &self,
        latch_version: u64,
        error: GBPTreeError,
    ) -> Result<Attempt<T>, GBPTreeError> {
        if self.latch.validate(latch_version) {
            Err(error)
        } else {
            Ok(Attempt::Retry)
        }
    }

    /// Point lookup of an encoded key.
    pub(crate) fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>, GBPTreeError> {
        self.ensure_open()?;
        let mut backoff = Backoff::new(self.seek_max_retries);
        loop {
            match self.try_find_leaf(Some(key))? {
                Attempt::Done(leaf) => {
                    return Ok(leaf
                        .entries
                        .binary_search_by(|entry| self.layout.compare(&entry.key, key))
                        .ok()
                        .and_then(|i| leaf.entries.into_iter().nth(i))
                        .map(|entry| entry.value));
                }
                Attempt::Retry => backoff.retry(self.monitor.as_ref())?,
            }
        }
    }
}

/// Lazy, ordered sequence of entries in `[from, to)`.
///
/// Entries are fetched a leaf at a time. The cursor tolerates concurrent
/// writes: it returns every entry that stays in the tree for the whole scan,
/// in key order and without duplicates.
pub struct SeekCursor<L: Layout> {
    core: Arc<TreeCore<L>>,
    from: Option<Vec<u8>>,
    to: Option<Vec<u8>>,
    last_key: Option<Vec<u8>>,
    buffer: VecDeque<LeafEntry>,
    leaf: Option<LeafRead>,
    finished: bool,
    backoff: Backoff,
}

impl<L: Layout> SeekCursor<L> {
    pub(crate) fn new(core: Arc<TreeCore<L>>, from: Option<Vec<u8>>, to: Option<Vec<u8>>) -> Self {
        let backoff = Backoff::new(core.seek_max_retries);
        let finished = matches!(
            (&from, &to),
            (Some(from), Some(to)) if core.layout.compare(from, to) != std::cmp::Ordering::Less
        );
        Self {
            core,
            from,
            to,
            last_key: None,
            buffer: VecDeque::new(),
            leaf: None,
            finished,
            backoff,
        }
    }

    /// Next entry in key order, `None` when the range is exhausted.
    pub fn next_entry(&mut self) -> Result<Option<(L::Key, L::Value)>, GBPTreeError> {
        match self.next_raw() {
            Ok(Some(entry)) => {
                let key = self.core.layout.read_key(&entry.key)?;
                let value = self.core.layout.read_value(&entry.value)?;
                Ok(Some((key, value)))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.finished = true;
                self.buffer.clear();
                Err(e)
            }
        }
    }

    /// Next entry with key and value still encoded.
    pub fn next_raw(&mut self) -> Result<Option<LeafEntry>, GBPTreeError> {
        loop {
            if let Some(entry) = self.buffer.pop_front() {
                self.last_key = Some(entry.key.clone());
                return Ok(Some(entry));
            }
            if self.finished {
                return Ok(None);
            }
            self.core.ensure_open()?;

            let attempt = match &self.leaf {
                None => match self.core.try_find_leaf(self.resume_key())? {
                    Attempt::Done(leaf) => Attempt::Done(Some(leaf)),
                    Attempt::Retry => Attempt::Retry,
                },
                Some(current) => self.core.try_read_right(current)?,
            };
            match attempt {
                Attempt::Done(Some(leaf)) => self.fill(leaf),
                Attempt::Done(None) => self.finished = true,
                Attempt::Retry => {
                    self.leaf = None;
                    self.backoff.retry(self.core.monitor.as_ref())?;
                }
            }
        }
    }

    /// Where a descent from the root has to resume.
    fn resume_key(&self) -> Option<&[u8]> {
        self.last_key.as_deref().or(self.from.as_deref())
    }

    fn fill(&mut self, mut leaf: LeafRead) {
        let layout = &self.core.layout;
        for entry in std::mem::take(&mut leaf.entries) {
            let after_start = match (&self.last_key, &self.from) {
                (Some(last), _) => layout.compare(&entry.key, last) == std::cmp::Ordering::Greater,
                (None, Some(from)) => layout.compare(&entry.key, from) != std::cmp::Ordering::Less,
                (None, None) => true,
            };
            if !after_start {
                continue;
            }
            if let Some(to) = &self.to
                && layout.compare(&entry.key, to) != std::cmp::Ordering::Less
            {
                self.finished = true;
                break;
            }
            self.buffer.push_back(entry);
        }
        if !self.buffer.is_empty() {
            self.backoff.reset();
        }
        self.leaf = Some(leaf);
    }
}

impl<L: Layout> Iterator for SeekCursor<L> {
    type Item = Result<(L::Key, L::Value), GBPTreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

impl<L: Layout> std::fmt::Debug for SeekCursor<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeekCursor")
            .field("last_key", &self.last_key)
            .field("buffered", &self.buffer.len())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

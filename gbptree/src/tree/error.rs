//! Tree error types.

use std::io;

use crate::page_cache::{PageCacheError, PageId};
use crate::tree::layout::LayoutError;
use crate::tree::meta::MetaError;
use crate::tree::node::NodeError;

/// The tree's persistent structure is not what it must be.
///
/// Never retried inside the tree; the caller decides whether to run a
/// cleanup or consistency check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeInconsistency {
    /// Neither tree state slot holds a valid record.
    BothStatesInvalid { a: String, b: String },
    /// Both tree state slots carry the same generation stamp.
    EqualStateGenerations { stable: u64, unstable: u64 },
    /// The meta page disagrees with what the caller opened the tree with.
    MetaMismatch {
        field: &'static str,
        expected: String,
        actual: String,
    },
    /// A page that must hold a tree structure could not be decoded.
    CorruptPage { page_id: PageId, detail: String },
}

impl std::fmt::Display for TreeInconsistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BothStatesInvalid { a, b } => {
                write!(f, "both tree states are invalid (A: {a}; B: {b})")
            }
            Self::EqualStateGenerations { stable, unstable } => write!(
                f,
                "both tree states carry generation stamp ({stable}, {unstable})"
            ),
            Self::MetaMismatch {
                field,
                expected,
                actual,
            } => write!(f, "meta {field} mismatch: expected {expected}, found {actual}"),
            Self::CorruptPage { page_id, detail } => {
                write!(f, "corrupt tree page {page_id}: {detail}")
            }
        }
    }
}

impl std::error::Error for TreeInconsistency {}

/// A mutation was attempted on a tree opened read-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOnlyViolation {
    pub operation: &'static str,
}

impl std::fmt::Display for ReadOnlyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} is not allowed on a read-only tree", self.operation)
    }
}

impl std::error::Error for ReadOnlyViolation {}

/// Errors returned by tree operations.
#[derive(Debug)]
pub enum GBPTreeError {
    /// Structural or checksum violation in the persisted tree.
    TreeInconsistency(TreeInconsistency),
    /// Mutation on a read-only tree.
    ReadOnly(ReadOnlyViolation),
    /// Page cache error.
    PageCache(PageCacheError),
    /// Meta page error.
    Meta(MetaError),
    /// Key or value codec error.
    Layout(LayoutError),
    /// A key/value pair does not fit in a tree node.
    EntryTooLarge {
        key_size: usize,
        entry_size: usize,
        max_key_size: usize,
        max_entry_size: usize,
    },
    /// Header data does not fit in a tree state page.
    HeaderTooLarge { size: usize, max: usize },
    /// A checkpoint was requested before crash cleanup has run.
    CleanupPending,
    /// The tree has been closed.
    Closed,
    /// A seek restarted too many times without making progress.
    SeekRetriesExhausted { attempts: u32 },
    /// I/O error.
    Io(io::Error),
    /// An internal lock was poisoned by a panicking thread.
    LockPoisoned,
    /// An earlier change failed after writing some of its pages. Writes
    /// and checkpoints are refused until the tree is reopened.
    WriteFailed,
}

impl std::fmt::Display for GBPTreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TreeInconsistency(e) => write!(f, "tree inconsistency: {e}"),
            Self::ReadOnly(e) => write!(f, "{e}"),
            Self::PageCache(e) => write!(f, "page cache error: {e}"),
            Self::Meta(e) => write!(f, "meta error: {e}"),
            Self::Layout(e) => write!(f, "layout error: {e}"),
            Self::EntryTooLarge {
                key_size,
                entry_size,
                max_key_size,
                max_entry_size,
            } => write!(
                f,
                "entry too large: key {key_size} bytes (max {max_key_size}), \
                 entry {entry_size} bytes (max {max_entry_size})"
            ),
            Self::HeaderTooLarge { size, max } => {
                write!(f, "header data too large: {size} bytes (max {max})")
            }
            Self::CleanupPending => {
                write!(f, "crash cleanup has not completed; checkpoint refused")
            }
            Self::Closed => write!(f, "tree is closed"),
            Self::SeekRetriesExhausted { attempts } => {
                write!(f, "seek gave up after {attempts} restarts without progress")
            }
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::LockPoisoned => write!(f, "tree lock poisoned"),
            Self::WriteFailed => {
                write!(f, "an earlier change failed part way through; reopen the tree")
            }
        }
    }
}

impl std::error::Error for GBPTreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::TreeInconsistency(e) => Some(e),
            Self::ReadOnly(e) => Some(e),
            Self::PageCache(e) => Some(e),
            Self::Meta(e) => Some(e),
            Self::Layout(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl GBPTreeError {
    /// Whether this error reports a structural inconsistency.
    #[must_use]
    pub const fn is_inconsistency(&self) -> bool {
        matches!(self, Self::TreeInconsistency(_))
    }

    pub(crate) fn corrupt(page_id: PageId, detail: impl std::fmt::Display) -> Self {
        Self::TreeInconsistency(TreeInconsistency::CorruptPage {
            page_id,
            detail: detail.to_string(),
        })
    }

    pub(crate) fn node(page_id: PageId, e: &NodeError) -> Self {
        Self::corrupt(page_id, e)
    }
}

impl From<TreeInconsistency> for GBPTreeError {
    fn from(e: TreeInconsistency) -> Self {
        Self::TreeInconsistency(e)
    }
}

impl From<ReadOnlyViolation> for GBPTreeError {
    fn from(e: ReadOnlyViolation) -> Self {
        Self::ReadOnly(e)
    }
}

impl From<PageCacheError> for GBPTreeError {
    fn from(e: PageCacheError) -> Self {
        // A page failing its checksum inside the tree file is a tree
        // inconsistency, not a transient cache problem.
        match e {
            PageCacheError::CorruptPage { page_id, source } => Self::corrupt(page_id, source),
            other => Self::PageCache(other),
        }
    }
}

impl From<MetaError> for GBPTreeError {
    fn from(e: MetaError) -> Self {
        Self::Meta(e)
    }
}

impl From<LayoutError> for GBPTreeError {
    fn from(e: LayoutError) -> Self {
        Self::Layout(e)
    }
}

impl From<io::Error> for GBPTreeError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

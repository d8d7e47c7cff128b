//! GBPTree: a generation-aware, crash-safe B+tree over a paged file.
//!
//! # Structure
//!
//! - Internal nodes: separator keys and child pointers stamped with the
//!   generation the child was written in
//! - Leaf nodes: ordered key/value entries, doubly linked through
//!   generation-safe sibling pointers for range scans
//!
//! # Durability
//!
//! Nothing written since the last checkpoint survives a crash. A checkpoint
//! flushes all pages, then flips the newest tree state to the other of two
//! state slots. Nodes from a checkpointed generation are copied, never
//! overwritten, so the previous checkpoint stays intact until the flip.
//!
//! # Usage
//!
//! ```text
//! let tree = GBPTree::builder(&page_cache, path, SimpleLongLayout).build()?;
//! tree.insert(&1, &100)?;
//! tree.checkpoint(HeaderUpdate::CarryOver)?;
//! for entry in tree.seek(&0, &10)? {
//!     let (key, value) = entry?;
//! }
//! tree.close()?;
//! ```

mod cleanup;
mod consistency;
mod error;
mod freelist;
mod gbptree;
mod header;
mod layout;
mod meta;
mod monitor;
pub mod node;
mod pointer;
mod seek;
mod state;
mod writer;

pub use cleanup::{CleanupReport, CrashGenerationCleaner};
pub use consistency::ConsistencyReport;
pub use error::{GBPTreeError, ReadOnlyViolation, TreeInconsistency};
pub use freelist::{FreeEntry, FreeList};
pub use gbptree::{GBPTree, GBPTreeBuilder};
pub use header::{
    CollectingVisitor, HeaderReader, HeaderUpdate, HeaderVisitor, visit_header,
};
pub use layout::{ByteLayout, DynLayout, Layout, LayoutError, SimpleLongLayout, named_identifier};
pub use meta::{FORMAT_VERSION, MAGIC, Meta, MetaError};
pub use monitor::{LoggingMonitor, Monitor, NoMonitor};
pub use node::{LeafEntry, NodeError};
pub use pointer::{GenSafePointer, GenSafePointerPair, Generation};
pub use seek::SeekCursor;
pub use state::{
    BASE_PAGE_ID, META_PAGE_ID, STATE_VERSION, StateError, StateSlot, TreeState, TreeStatePair,
    TreeStateRecord,
};

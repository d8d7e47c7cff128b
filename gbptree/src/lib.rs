// Layering, bottom-up:
// 1. fs          - raw byte-addressable files (std-backed or in-memory)
// 2. page_cache  - checksummed, versioned pages pinned through cursors
// 3. tree        - the crash-safe GBPTree engine on top of a paged file
// 4. bootstrap   - opening a tree file without knowing its layout up front
// 5. wal         - version-aware, checksum-chained log entries and replay
//
// Background work (crash cleanup, index sampling) runs through the
// scheduler and the cleanup collectors.

#![cfg_attr(
    test,
    allow(clippy::disallowed_methods, clippy::expect_used, clippy::unwrap_used)
)]

pub mod bootstrap;
pub mod collector;
pub mod config;
pub mod failpoint;
pub mod fs;
pub mod page_cache;
pub mod sampling;
pub mod scheduler;
pub mod tree;
pub mod wal;

mod e2e_tests;

pub use bootstrap::{Bootstrap, BootstrapError, GBPTreeBootstrapper, IllegalStateError};
pub use collector::RecoveryCleanupWorkCollector;
pub use config::{ConfigError, TreeConfig};
pub use page_cache::{PageCache, PagedFile};
pub use tree::{GBPTree, GBPTreeBuilder, GBPTreeError, Layout};

//! Crash generation cleanup.
//!
//! Sibling and successor pointers are updated in place, in the slot of a
//! generation-safe pointer pair that does not hold the last stable value.
//! A session that crashed leaves such slots stamped with a generation that
//! was never checkpointed. Readers already ignore them; the cleaner clears
//! them so that the next checkpoint, which makes every generation up to the
//! current one stable, cannot resurrect them.

use std::sync::Weak;
use std::sync::atomic::Ordering;

use crate::collector::{CleanupError, CleanupJob};
use crate::page_cache::{PageCacheError, PinMode};
use crate::tree::error::GBPTreeError;
use crate::tree::gbptree::TreeCore;
use crate::tree::layout::Layout;
use crate::tree::node::{self, PointerField};
use crate::tree::pointer::GenSafePointerPair;
use crate::tree::state::BASE_PAGE_ID;

/// Outcome of a crash generation cleanup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub pages_visited: u64,
    pub pointers_cleaned: u64,
    /// Pages past the persisted high-water mark, written by the crashed
    /// session and free again.
    pub reclaimed_tail_pages: u64,
}

impl<L: Layout> TreeCore<L> {
    /// Clear every pointer slot written by a crashed generation.
    ///
    /// Pages that are free may have been torn by the crash; a checksum
    /// failure on them is ignored. Any other page must be readable.
    pub(crate) fn clean_crashed(&self) -> Result<CleanupReport, GBPTreeError> {
        let writer = self.lock_writer()?;
        if !self.cleanup_pending.load(Ordering::Acquire) {
            return Ok(CleanupReport::default());
        }
        let generation = self.snapshot()?.generation;
        let last_id = writer.free_list.last_id();
        tracing::info!(
            path = %self.paged_file.path().display(),
            stable = generation.stable,
            unstable = generation.unstable,
            last_id,
            "crash cleanup started"
        );

        let mut report = CleanupReport::default();
        for id in BASE_PAGE_ID..=last_id {
            let mut cursor = match self.paged_file.pin(id, PinMode::Write) {
                Ok(cursor) => cursor,
                Err(PageCacheError::CorruptPage { .. })
                    if writer.free_list.contains(id)
                        || writer.free_list.chain_pages().contains(&id) =>
                {
                    tracing::debug!(page_id = id, "skipping torn free page");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            report.pages_visited += 1;
            if !node::is_node_page(cursor.page()) {
                continue;
            }

            let mut cleaned = 0;
            for field in PointerField::ALL {
                let mut pair = GenSafePointerPair::read_from(cursor.page(), field.offset());
                let n = pair.clean_crashed(generation);
                if n > 0 {
                    pair.write_to(cursor.page_mut(), field.offset());
                    cleaned += n;
                }
            }
            if cleaned > 0 {
                cursor.commit()?;
                report.pointers_cleaned += cleaned as u64;
            }
        }
        report.reclaimed_tail_pages = self.paged_file.page_count().saturating_sub(last_id + 1);
        self.cleanup_pending.store(false, Ordering::Release);
        drop(writer);

        tracing::info!(
            pages_visited = report.pages_visited,
            pointers_cleaned = report.pointers_cleaned,
            reclaimed_tail_pages = report.reclaimed_tail_pages,
            "crash cleanup finished"
        );
        self.monitor.cleanup_finished(&report);
        Ok(report)
    }
}

/// Cleanup job registered when a tree is opened after a crash.
///
/// Holds the tree weakly: a tree closed or dropped before the job runs
/// needs no cleanup from it.
pub struct CrashGenerationCleaner<L: Layout> {
    core: Weak<TreeCore<L>>,
}

impl<L: Layout> CrashGenerationCleaner<L> {
    pub(crate) const fn new(core: Weak<TreeCore<L>>) -> Self {
        Self { core }
    }
}

impl<L: Layout> CleanupJob for CrashGenerationCleaner<L> {
    fn description(&self) -> String {
        self.core.upgrade().map_or_else(
            || "crash generation cleanup of a dropped tree".to_string(),
            |core| {
                format!(
                    "crash generation cleanup of {}",
                    core.paged_file.path().display()
                )
            },
        )
    }

    fn needed(&self) -> bool {
        self.core.upgrade().is_some_and(|core| {
            core.cleanup_pending.load(Ordering::Acquire) && core.ensure_open().is_ok()
        })
    }

    fn run(&self) -> Result<(), CleanupError> {
        let Some(core) = self.core.upgrade() else {
            return Ok(());
        };
        if core.ensure_open().is_err() {
            return Ok(());
        }
        core.clean_crashed().map(|_| ()).map_err(|e| {
            core.monitor.cleanup_failed(&e);
            CleanupError {
                description: self.description(),
                cause: e.to_string(),
            }
        })
    }
}

impl<L: Layout> std::fmt::Debug for CrashGenerationCleaner<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrashGenerationCleaner")
            .field("core", &self.core)
            .finish()
    }
}

//! Tree lifecycle events.

use std::fmt::Debug;
use std::path::Path;

use crate::tree::cleanup::CleanupReport;
use crate::tree::error::GBPTreeError;
use crate::tree::pointer::Generation;

/// Receives tree lifecycle events. Every method defaults to doing nothing.
pub trait Monitor: Send + Sync + Debug {
    /// The tree was opened. `clean` tells whether it was closed cleanly.
    fn startup_state(&self, _path: &Path, _clean: bool, _generation: Generation) {}

    fn checkpoint_completed(&self, _generation: Generation, _pages_flushed: usize) {}

    /// A crash cleanup job was handed to the cleanup collector.
    fn cleanup_registered(&self) {}

    fn cleanup_finished(&self, _report: &CleanupReport) {}

    fn cleanup_failed(&self, _error: &GBPTreeError) {}

    /// A seek restarted from the root.
    fn seek_retried(&self, _attempts_without_progress: u32) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoMonitor;

impl Monitor for NoMonitor {}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingMonitor;

impl Monitor for LoggingMonitor {
    fn startup_state(&self, path: &Path, clean: bool, generation: Generation) {
        tracing::info!(
            path = %path.display(),
            clean,
            stable = generation.stable,
            unstable = generation.unstable,
            "tree opened"
        );
    }

    fn checkpoint_completed(&self, generation: Generation, pages_flushed: usize) {
        tracing::info!(
            stable = generation.stable,
            pages_flushed,
            "checkpoint completed"
        );
    }

    fn cleanup_registered(&self) {
        tracing::info!("crash cleanup registered");
    }

    fn cleanup_finished(&self, report: &CleanupReport) {
        tracing::info!(
            pages_visited = report.pages_visited,
            pointers_cleaned = report.pointers_cleaned,
            reclaimed_tail_pages = report.reclaimed_tail_pages,
            "crash cleanup finished"
        );
    }

    fn cleanup_failed(&self, error: &GBPTreeError) {
        tracing::error!(error = %error, "crash cleanup failed");
    }

    fn seek_retried(&self, attempts_without_progress: u32) {
        tracing::trace!(attempts_without_progress, "seek restarted");
    }
}

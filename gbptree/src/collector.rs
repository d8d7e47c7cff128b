//! Recovery cleanup work collectors.
//!
//! A tree opened after a crash hands a [`CleanupJob`] to the collector it
//! was built with. The collector decides when the job runs: right away
//! ([`ImmediateCleanupCollector`]), when the owner asks for it or in the
//! background ([`GroupingCleanupCollector`]), or never
//! ([`IgnoreCleanupCollector`], for read-only inspection).

use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::scheduler::{Group, JobHandle, JobScheduler};

/// Post-crash maintenance work.
pub trait CleanupJob: Send + Sync + Debug {
    fn description(&self) -> String;

    /// Whether the job still has work to do.
    fn needed(&self) -> bool;

    fn run(&self) -> Result<(), CleanupError>;
}

/// A cleanup job failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupError {
    pub description: String,
    pub cause: String,
}

impl std::fmt::Display for CleanupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failed: {}", self.description, self.cause)
    }
}

impl std::error::Error for CleanupError {}

/// Receives cleanup jobs registered while trees are opened.
pub trait RecoveryCleanupWorkCollector: Send + Sync + Debug {
    fn add(&self, job: Arc<dyn CleanupJob>);
}

fn run_job(job: &dyn CleanupJob) -> Result<(), CleanupError> {
    if !job.needed() {
        tracing::debug!(job = %job.description(), "cleanup no longer needed");
        return Ok(());
    }
    tracing::info!(job = %job.description(), "running cleanup");
    job.run().inspect_err(|e| tracing::error!(error = %e, "cleanup failed"))
}

/// Runs every job as soon as it is added.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateCleanupCollector;

impl RecoveryCleanupWorkCollector for ImmediateCleanupCollector {
    fn add(&self, job: Arc<dyn CleanupJob>) {
        // A failed job stays needed; the owner can retry it.
        if let Err(e) = run_job(job.as_ref()) {
            tracing::warn!(job = %e.description, error = %e.cause, "cleanup left pending");
        }
    }
}

/// Drops every job. The trees they belong to stay in need of cleanup.
#[derive(Debug, Default, Clone, Copy)]
pub struct IgnoreCleanupCollector;

impl RecoveryCleanupWorkCollector for IgnoreCleanupCollector {
    fn add(&self, job: Arc<dyn CleanupJob>) {
        tracing::debug!(job = %job.description(), "cleanup ignored");
    }
}

/// Collects jobs and runs them together.
///
/// Jobs added after [`GroupingCleanupCollector::shutdown`] are dropped.
#[derive(Debug, Default)]
pub struct GroupingCleanupCollector {
    state: Mutex<GroupingState>,
}

#[derive(Debug, Default)]
struct GroupingState {
    jobs: Vec<Arc<dyn CleanupJob>>,
    shut_down: bool,
}

impl GroupingCleanupCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, GroupingState> {
        // A panicking job never holds this lock, so poisoning only means a
        // panic in `add`; the job list is still valid.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Number of jobs waiting to run.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state().jobs.len()
    }

    /// Run every collected job on the calling thread, in the order they were
    /// added. Jobs that fail are kept for a later run; the first error is
    /// returned after all jobs were tried.
    pub fn run_all(&self) -> Result<(), CleanupError> {
        let jobs = std::mem::take(&mut self.state().jobs);
        let mut first_error = None;
        let mut failed = Vec::new();
        for job in jobs {
            if let Err(e) = run_job(job.as_ref()) {
                first_error.get_or_insert(e);
                failed.push(job);
            }
        }
        if !failed.is_empty() {
            let mut state = self.state();
            failed.append(&mut state.jobs);
            state.jobs = failed;
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Run the collected jobs in the background in the recovery cleanup
    /// group.
    pub fn start(self: &Arc<Self>, scheduler: &dyn JobScheduler) -> JobHandle {
        let collector = Arc::clone(self);
        scheduler.schedule(
            Group::RecoveryCleanup,
            Box::new(move || {
                if let Err(e) = collector.run_all() {
                    tracing::warn!(
                        job = %e.description,
                        error = %e.cause,
                        pending = collector.pending(),
                        "background cleanup left jobs pending"
                    );
                }
            }),
        )
    }

    /// Drop pending jobs and refuse new ones.
    pub fn shutdown(&self) {
        let mut state = self.state();
        state.shut_down = true;
        let dropped = std::mem::take(&mut state.jobs).len();
        drop(state);
        if dropped > 0 {
            tracing::warn!(dropped, "cleanup collector shut down with pending jobs");
        }
    }
}

impl RecoveryCleanupWorkCollector for GroupingCleanupCollector {
    fn add(&self, job: Arc<dyn CleanupJob>) {
        let mut state = self.state();
        if state.shut_down {
            tracing::debug!(job = %job.description(), "collector shut down; cleanup dropped");
            return;
        }
        state.jobs.push(job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::TokioJobScheduler;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct CountingJob {
        runs: AtomicUsize,
        fail: AtomicBool,
    }

    impl CleanupJob for CountingJob {
        fn description(&self) -> String {
            "counting job".to_string()
        }

        fn needed(&self) -> bool {
            self.runs.load(Ordering::SeqCst) == 0
        }

        fn run(&self) -> Result<(), CleanupError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(CleanupError {
                    description: self.description(),
                    cause: "asked to fail".to_string(),
                });
            }
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_immediate_runs_on_add() {
        let job = Arc::new(CountingJob::default());
        ImmediateCleanupCollector.add(job.clone());
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);

        // Not needed any more, so a second add is a no-op.
        ImmediateCleanupCollector.add(job.clone());
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ignore_never_runs() {
        let job = Arc::new(CountingJob::default());
        IgnoreCleanupCollector.add(job.clone());
        assert_eq!(job.runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_grouping_runs_on_demand_and_keeps_failures() {
        let collector = GroupingCleanupCollector::new();
        let ok = Arc::new(CountingJob::default());
        let failing = Arc::new(CountingJob::default());
        failing.fail.store(true, Ordering::SeqCst);
        collector.add(ok.clone());
        collector.add(failing.clone());
        assert_eq!(collector.pending(), 2);
        assert_eq!(ok.runs.load(Ordering::SeqCst), 0);

        let err = collector.run_all().expect_err("failing job reports");
        assert_eq!(err.cause, "asked to fail");
        assert_eq!(ok.runs.load(Ordering::SeqCst), 1);
        assert_eq!(collector.pending(), 1);

        failing.fail.store(false, Ordering::SeqCst);
        collector.run_all().expect("retry succeeds");
        assert_eq!(failing.runs.load(Ordering::SeqCst), 1);
        assert_eq!(collector.pending(), 0);
    }

    #[test]
    fn test_grouping_start_runs_in_background() {
        let runtime = tokio::runtime::Runtime::new().expect("create runtime");
        let scheduler = TokioJobScheduler::new(runtime.handle().clone());
        let collector = Arc::new(GroupingCleanupCollector::new());
        let job = Arc::new(CountingJob::default());
        collector.add(job.clone());

        collector.start(&scheduler).wait().expect("cleanup completes");
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_cleanup_stays_retryable() {
        let job = Arc::new(CountingJob::default());
        job.fail.store(true, Ordering::SeqCst);
        ImmediateCleanupCollector.add(job.clone());
        assert!(job.needed());

        let runtime = tokio::runtime::Runtime::new().expect("create runtime");
        let scheduler = TokioJobScheduler::new(runtime.handle().clone());
        let collector = Arc::new(GroupingCleanupCollector::new());
        collector.add(job.clone());
        collector.start(&scheduler).wait().expect("background run completes");
        assert_eq!(collector.pending(), 1);

        job.fail.store(false, Ordering::SeqCst);
        collector.start(&scheduler).wait().expect("background run completes");
        assert_eq!(collector.pending(), 0);
        assert!(!job.needed());
    }

    #[test]
    fn test_grouping_shutdown_drops_jobs() {
        let collector = GroupingCleanupCollector::new();
        collector.add(Arc::new(CountingJob::default()));
        collector.shutdown();
        assert_eq!(collector.pending(), 0);
        collector.add(Arc::new(CountingJob::default()));
        assert_eq!(collector.pending(), 0);
    }
}

//! Background job scheduling.
//!
//! Jobs are plain blocking closures tagged with the [`Group`] they belong
//! to. [`TokioJobScheduler`] runs them on the blocking pool of a tokio
//! runtime; the returned [`JobHandle`] can be waited on from any thread.

use std::fmt::Debug;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// A unit of background work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Scheduler groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Group {
    IndexSampling,
    RecoveryCleanup,
}

impl Group {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::IndexSampling => "index sampling",
            Self::RecoveryCleanup => "recovery cleanup",
        }
    }
}

impl std::fmt::Display for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Runs jobs in the background.
pub trait JobScheduler: Send + Sync + Debug {
    fn schedule(&self, group: Group, job: Job) -> JobHandle;
}

/// Handle to a scheduled job.
///
/// The null instance stands for a submission that was dropped; waiting on
/// it returns immediately.
#[derive(Debug)]
pub struct JobHandle {
    task: Option<JoinHandle<()>>,
}

impl JobHandle {
    #[must_use]
    pub const fn null_instance() -> Self {
        Self { task: None }
    }

    #[must_use]
    pub const fn from_task(task: JoinHandle<()>) -> Self {
        Self { task: Some(task) }
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.task.is_none()
    }

    /// Whether the job has finished. Always true for the null instance.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Block the calling thread until the job has finished.
    ///
    /// # Pre-conditions
    ///
    /// - not called from inside an async task of the scheduler's runtime
    pub fn wait(self) -> Result<(), JobError> {
        let Some(task) = self.task else {
            return Ok(());
        };
        futures::executor::block_on(task).map_err(|e| {
            if e.is_cancelled() {
                JobError::Cancelled
            } else {
                JobError::Panicked(e.to_string())
            }
        })
    }
}

/// Why waiting on a job failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// The job panicked.
    Panicked(String),
    /// The job was cancelled before it completed.
    Cancelled,
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Panicked(reason) => write!(f, "job panicked: {reason}"),
            Self::Cancelled => write!(f, "job was cancelled"),
        }
    }
}

impl std::error::Error for JobError {}

/// Runs jobs with `spawn_blocking` on a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioJobScheduler {
    handle: Handle,
}

impl TokioJobScheduler {
    #[must_use]
    pub const fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// A scheduler on the runtime of the calling context, if there is one.
    #[must_use]
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl JobScheduler for TokioJobScheduler {
    fn schedule(&self, group: Group, job: Job) -> JobHandle {
        tracing::trace!(group = %group, "scheduling job");
        let task = self.handle.spawn_blocking(move || {
            let span = tracing::debug_span!("job", group = group.name());
            let _entered = span.enter();
            job();
        });
        JobHandle::from_task(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_scheduled_job_runs_and_can_be_awaited() {
        let runtime = tokio::runtime::Runtime::new().expect("create runtime");
        let scheduler = TokioJobScheduler::new(runtime.handle().clone());
        let counter = Arc::new(AtomicUsize::new(0));

        let handles: Vec<JobHandle> = (0..4)
            .map(|_| {
                let counter = Arc::clone(&counter);
                scheduler.schedule(
                    Group::IndexSampling,
                    Box::new(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }),
                )
            })
            .collect();
        for handle in handles {
            assert!(!handle.is_null());
            handle.wait().expect("job completes");
        }
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_panicking_job_reports_error() {
        let runtime = tokio::runtime::Runtime::new().expect("create runtime");
        let scheduler = TokioJobScheduler::new(runtime.handle().clone());
        let handle = scheduler.schedule(Group::RecoveryCleanup, Box::new(|| panic!("boom")));
        assert!(matches!(handle.wait(), Err(JobError::Panicked(_))));
    }

    #[test]
    fn test_null_instance_is_finished() {
        let handle = JobHandle::null_instance();
        assert!(handle.is_null());
        assert!(handle.is_finished());
        assert_eq!(handle.wait(), Ok(()));
    }

    #[test]
    fn test_current_outside_runtime_is_none() {
        assert!(TokioJobScheduler::current().is_none());
        let runtime = tokio::runtime::Runtime::new().expect("create runtime");
        let _guard = runtime.enter();
        assert!(TokioJobScheduler::current().is_some());
    }
}

//! Index sampling.
//!
//! A sampling job scans one index tree and records its size and number of
//! distinct values. [`IndexSamplingJobTracker`] runs at most one job per
//! index at a time, caps how many run at once, and drains every running
//! job on shutdown.
//!
//! # Invariants
//!
//! - an index id is in the running set from the moment its job is
//!   scheduled until the job has finished, successfully or not
//! - once stopped, the tracker schedules nothing

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::config::TreeConfig;
use crate::scheduler::{Group, JobHandle, JobScheduler};
use crate::tree::{GBPTree, GBPTreeError, Layout};

/// Identifies an index.
pub type IndexId = u64;

/// Size statistics of one index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexSample {
    /// Number of entries in the index.
    pub entries: u64,
    /// Number of distinct indexed values.
    pub distinct_values: u64,
}

/// Latest sample of every index.
#[derive(Debug, Default)]
pub struct IndexStatisticsStore {
    samples: Mutex<HashMap<IndexId, IndexSample>>,
}

impl IndexStatisticsStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the sample of `index`.
    pub fn replace(&self, index: IndexId, sample: IndexSample) {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(index, sample);
    }

    #[must_use]
    pub fn sample(&self, index: IndexId) -> Option<IndexSample> {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&index)
            .copied()
    }
}

/// Why a sampling job failed.
#[derive(Debug)]
pub enum SamplingError {
    Tree(GBPTreeError),
}

impl std::fmt::Display for SamplingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tree(err) => write!(f, "sampling failed: {err}"),
        }
    }
}

impl std::error::Error for SamplingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Tree(err) => Some(err),
        }
    }
}

impl From<GBPTreeError> for SamplingError {
    fn from(err: GBPTreeError) -> Self {
        Self::Tree(err)
    }
}

/// A job the tracker can run.
pub trait IndexSamplingJob: Send + 'static {
    fn index_id(&self) -> IndexId;

    fn run(self: Box<Self>) -> Result<(), SamplingError>;
}

/// Samples one tree into a statistics store.
///
/// Keys are read as an indexed value followed by an entry id; the first
/// `value_prefix` bytes of each encoded key are the value. Without a prefix
/// every key is its own value.
#[derive(Debug)]
pub struct TreeSamplingJob<L: Layout> {
    index: IndexId,
    tree: Arc<GBPTree<L>>,
    store: Arc<IndexStatisticsStore>,
    value_prefix: Option<usize>,
}

impl<L: Layout> TreeSamplingJob<L> {
    #[must_use]
    pub const fn new(index: IndexId, tree: Arc<GBPTree<L>>, store: Arc<IndexStatisticsStore>) -> Self {
        Self {
            index,
            tree,
            store,
            value_prefix: None,
        }
    }

    /// Count distinct values on the first `len` bytes of each key.
    #[must_use]
    pub const fn value_prefix(mut self, len: usize) -> Self {
        self.value_prefix = Some(len);
        self
    }

    /// Scan the tree. Keys arrive in order, so equal values are adjacent.
    pub fn sample(&self) -> Result<IndexSample, GBPTreeError> {
        let mut cursor = self.tree.seek_raw(None, None)?;
        let mut sample = IndexSample::default();
        let mut previous: Option<Vec<u8>> = None;
        while let Some(entry) = cursor.next_raw()? {
            sample.entries += 1;
            let value = match self.value_prefix {
                Some(len) => &entry.key[..len.min(entry.key.len())],
                None => &entry.key[..],
            };
            if previous.as_deref() != Some(value) {
                sample.distinct_values += 1;
                previous = Some(value.to_vec());
            }
        }
        Ok(sample)
    }
}

impl<L: Layout> IndexSamplingJob for TreeSamplingJob<L> {
    fn index_id(&self) -> IndexId {
        self.index
    }

    fn run(self: Box<Self>) -> Result<(), SamplingError> {
        let sample = self.sample()?;
        self.store.replace(self.index, sample);
        tracing::debug!(
            index = self.index,
            entries = sample.entries,
            distinct_values = sample.distinct_values,
            "sampled index"
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    stopped: bool,
    running: HashSet<IndexId>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<TrackerState>,
    /// Signalled whenever the running set shrinks.
    finished: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes a job's index from the running set when the job ends, including
/// by panic.
struct RunningGuard {
    shared: Arc<Shared>,
    index: IndexId,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.shared.lock().running.remove(&self.index);
        self.shared.finished.notify_all();
    }
}

/// Runs sampling jobs, at most one per index at a time.
#[derive(Debug)]
pub struct IndexSamplingJobTracker {
    scheduler: Arc<dyn JobScheduler>,
    job_limit: usize,
    shared: Arc<Shared>,
}

impl IndexSamplingJobTracker {
    #[must_use]
    pub fn new(scheduler: Arc<dyn JobScheduler>, config: &TreeConfig) -> Self {
        Self {
            scheduler,
            job_limit: config.sampling_job_limit.max(1),
            shared: Arc::default(),
        }
    }

    /// Schedule `job` in the index sampling group.
    ///
    /// Returns the null handle, without running the job, if the tracker is
    /// stopped or a job for the same index is still running. Requests are
    /// dropped, not queued.
    pub fn schedule_sampling_job(&self, job: Box<dyn IndexSamplingJob>) -> JobHandle {
        let index = job.index_id();
        let mut state = self.shared.lock();
        if state.stopped {
            tracing::debug!(index, "tracker stopped; sampling request dropped");
            return JobHandle::null_instance();
        }
        if !state.running.insert(index) {
            tracing::debug!(index, "sampling already running; request dropped");
            return JobHandle::null_instance();
        }

        drop(state);

        let guard = RunningGuard {
            shared: Arc::clone(&self.shared),
            index,
        };
        self.scheduler.schedule(
            Group::IndexSampling,
            Box::new(move || {
                let _guard = guard;
                tracing::debug!(index, "sampling started");
                if let Err(err) = job.run() {
                    tracing::warn!(index, error = %err, "sampling failed");
                }
            }),
        )
    }

    /// Whether another job may start now.
    #[must_use]
    pub fn can_execute_more_jobs(&self) -> bool {
        let state = self.shared.lock();
        !state.stopped && state.running.len() < self.job_limit
    }

    /// Block until fewer than the job limit are running, or the tracker is
    /// stopped. Returns whether more jobs can be executed.
    pub fn wait_until_can_execute_more_jobs(&self) -> bool {
        let mut state = self.shared.lock();
        while !state.stopped && state.running.len() >= self.job_limit {
            state = self
                .shared
                .finished
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        !state.stopped
    }

    /// Ids of the indexes being sampled, in ascending order.
    #[must_use]
    pub fn running_jobs(&self) -> Vec<IndexId> {
        let mut running: Vec<IndexId> = self.shared.lock().running.iter().copied().collect();
        running.sort_unstable();
        running
    }

    /// Stop accepting jobs and wait for every running job to finish.
    ///
    /// The wait cannot be interrupted.
    pub fn stop_and_await_all_jobs(&self) {
        let mut state = self.shared.lock();
        state.stopped = true;
        self.shared.finished.notify_all();
        let draining = state.running.len();
        while !state.running.is_empty() {
            state = self
                .shared
                .finished
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        tracing::info!(drained = draining, "sampling tracker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{EphemeralFileSystem, FileSystem};
    use crate::page_cache::PageCache;
    use crate::scheduler::TokioJobScheduler;
    use crate::tree::ByteLayout;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    /// Blocks until released, so tests control when it finishes.
    struct GatedJob {
        index: IndexId,
        started: mpsc::Sender<IndexId>,
        release: mpsc::Receiver<()>,
        runs: Arc<AtomicUsize>,
    }

    impl IndexSamplingJob for GatedJob {
        fn index_id(&self) -> IndexId {
            self.index
        }

        fn run(self: Box<Self>) -> Result<(), SamplingError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.started.send(self.index).expect("report start");
            self.release.recv().expect("release");
            Ok(())
        }
    }

    struct Harness {
        _runtime: tokio::runtime::Runtime,
        tracker: Arc<IndexSamplingJobTracker>,
        started: mpsc::Receiver<IndexId>,
        started_tx: mpsc::Sender<IndexId>,
        runs: Arc<AtomicUsize>,
    }

    impl Harness {
        fn new(job_limit: usize) -> Self {
            let runtime = tokio::runtime::Runtime::new().expect("create runtime");
            let scheduler = Arc::new(TokioJobScheduler::new(runtime.handle().clone()));
            let config = TreeConfig {
                sampling_job_limit: job_limit,
                ..TreeConfig::default()
            };
            let (started_tx, started) = mpsc::channel();
            Self {
                _runtime: runtime,
                tracker: Arc::new(IndexSamplingJobTracker::new(scheduler, &config)),
                started,
                started_tx,
                runs: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn gated(&self, index: IndexId) -> (Box<dyn IndexSamplingJob>, mpsc::Sender<()>) {
            let (release_tx, release) = mpsc::channel();
            let job = GatedJob {
                index,
                started: self.started_tx.clone(),
                release,
                runs: Arc::clone(&self.runs),
            };
            (Box::new(job), release_tx)
        }

        fn await_start(&self) -> IndexId {
            self.started
                .recv_timeout(Duration::from_secs(10))
                .expect("job started")
        }
    }

    #[test]
    fn test_duplicate_index_request_is_dropped() {
        let harness = Harness::new(4);
        let (first, release_first) = harness.gated(1);
        let handle = harness.tracker.schedule_sampling_job(first);
        assert!(!handle.is_null());
        assert_eq!(harness.await_start(), 1);

        let (duplicate, _release) = harness.gated(1);
        assert!(harness.tracker.schedule_sampling_job(duplicate).is_null());
        assert_eq!(harness.tracker.running_jobs(), vec![1]);

        release_first.send(()).expect("release");
        handle.wait().expect("job finishes");
        assert!(harness.tracker.running_jobs().is_empty());
        assert_eq!(harness.runs.load(Ordering::SeqCst), 1);

        let (again, release_again) = harness.gated(1);
        release_again.send(()).expect("pre-release");
        let handle = harness.tracker.schedule_sampling_job(again);
        assert!(!handle.is_null());
        handle.wait().expect("job finishes");
    }

    #[test]
    fn test_different_indexes_run_concurrently() {
        let harness = Harness::new(4);
        let (a, release_a) = harness.gated(1);
        let (b, release_b) = harness.gated(2);
        let handle_a = harness.tracker.schedule_sampling_job(a);
        let handle_b = harness.tracker.schedule_sampling_job(b);

        let mut started = vec![harness.await_start(), harness.await_start()];
        started.sort_unstable();
        assert_eq!(started, vec![1, 2]);
        assert_eq!(harness.tracker.running_jobs(), vec![1, 2]);

        release_a.send(()).expect("release");
        release_b.send(()).expect("release");
        handle_a.wait().expect("a finishes");
        handle_b.wait().expect("b finishes");
    }

    #[test]
    fn test_job_limit() {
        let harness = Harness::new(1);
        assert!(harness.tracker.can_execute_more_jobs());
        let (job, release) = harness.gated(1);
        let handle = harness.tracker.schedule_sampling_job(job);
        harness.await_start();
        assert!(!harness.tracker.can_execute_more_jobs());

        release.send(()).expect("release");
        assert!(harness.tracker.wait_until_can_execute_more_jobs());
        assert!(harness.tracker.can_execute_more_jobs());
        handle.wait().expect("finishes");
    }

    #[test]
    fn test_stop_drains_running_jobs_and_rejects_new_ones() {
        let harness = Harness::new(4);
        let (job, release) = harness.gated(7);
        let handle = harness.tracker.schedule_sampling_job(job);
        harness.await_start();

        let stopper = {
            let tracker = Arc::clone(&harness.tracker);
            std::thread::spawn(move || tracker.stop_and_await_all_jobs())
        };
        while harness.tracker.can_execute_more_jobs() {
            std::thread::yield_now();
        }
        let (late, _release) = harness.gated(8);
        assert!(harness.tracker.schedule_sampling_job(late).is_null());
        assert!(!stopper.is_finished());

        release.send(()).expect("release");
        stopper.join().expect("stopper");
        assert!(harness.tracker.running_jobs().is_empty());
        assert!(!harness.tracker.wait_until_can_execute_more_jobs());
        handle.wait().expect("finishes");
    }

    #[test]
    fn test_panicking_job_leaves_running_set() {
        struct Panics;
        impl IndexSamplingJob for Panics {
            fn index_id(&self) -> IndexId {
                3
            }
            fn run(self: Box<Self>) -> Result<(), SamplingError> {
                panic!("sampling blew up")
            }
        }

        let harness = Harness::new(2);
        let handle = harness.tracker.schedule_sampling_job(Box::new(Panics));
        assert!(handle.wait().is_err());
        assert!(harness.tracker.running_jobs().is_empty());
        harness.tracker.stop_and_await_all_jobs();
    }

    #[test]
    fn test_tree_sampling_job_counts_distinct_prefixes() {
        let fs: Arc<dyn FileSystem> = Arc::new(EphemeralFileSystem::new());
        let cache = PageCache::new(fs, 64);
        let tree = GBPTree::builder(&cache, "/index", ByteLayout::raw())
            .page_size(256)
            .build()
            .expect("create");
        for value in 0u8..10 {
            for entity in 0u8..=value {
                tree.insert(&vec![value, entity], &Vec::new()).expect("insert");
            }
        }
        let tree = Arc::new(tree);
        let store = Arc::new(IndexStatisticsStore::new());

        let job = TreeSamplingJob::new(5, Arc::clone(&tree), Arc::clone(&store)).value_prefix(1);
        Box::new(job).run().expect("sample");
        assert_eq!(
            store.sample(5),
            Some(IndexSample {
                entries: 55,
                distinct_values: 10,
            })
        );

        let whole_keys = TreeSamplingJob::new(6, tree, Arc::clone(&store));
        assert_eq!(whole_keys.sample().expect("sample").distinct_values, 55);
        assert_eq!(store.sample(6), None);
    }
}

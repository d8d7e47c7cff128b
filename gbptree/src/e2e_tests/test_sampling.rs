//! Test that sampling real trees runs at most one job per index while jobs
//! for other indexes proceed.

use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use crate::config::TreeConfig;
use crate::e2e_tests::helpers::{PAGE_SIZE, TestStore, insert_range};
use crate::sampling::{
    IndexId, IndexSample, IndexSamplingJob, IndexSamplingJobTracker, IndexStatisticsStore,
    SamplingError, TreeSamplingJob,
};
use crate::scheduler::TokioJobScheduler;
use crate::tree::{GBPTree, SimpleLongLayout};

/// Samples a tree once released.
struct HeldSampling {
    job: TreeSamplingJob<SimpleLongLayout>,
    started: mpsc::Sender<IndexId>,
    release: mpsc::Receiver<()>,
}

impl IndexSamplingJob for HeldSampling {
    fn index_id(&self) -> IndexId {
        self.job.index_id()
    }

    fn run(self: Box<Self>) -> Result<(), SamplingError> {
        let Self {
            job,
            started,
            release,
        } = *self;
        let _ = started.send(job.index_id());
        let _ = release.recv();
        Box::new(job).run()
    }
}

fn index_tree(store: &TestStore, index: IndexId, entries: u64) -> Arc<GBPTree<SimpleLongLayout>> {
    let tree = GBPTree::builder(&store.page_cache, format!("/index-{index}.db"), SimpleLongLayout)
        .page_size(PAGE_SIZE)
        .build()
        .expect("Failed to open tree");
    insert_range(&tree, 0..entries);
    Arc::new(tree)
}

#[test]
fn test_sampling_trees_at_most_once_per_index() {
    let store = TestStore::new();
    let runtime = tokio::runtime::Runtime::new().expect("Failed to create runtime");
    let scheduler = Arc::new(TokioJobScheduler::new(runtime.handle().clone()));
    let config = TreeConfig {
        sampling_job_limit: 4,
        ..TreeConfig::default()
    };
    let tracker = IndexSamplingJobTracker::new(scheduler, &config);
    let statistics = Arc::new(IndexStatisticsStore::new());
    let first = index_tree(&store, 1, 120);
    let second = index_tree(&store, 2, 30);

    let (started_tx, started) = mpsc::channel();
    let mut releases = Vec::new();
    let mut held = |index: IndexId, tree: &Arc<GBPTree<SimpleLongLayout>>| {
        let (release_tx, release) = mpsc::channel();
        releases.push(release_tx);
        Box::new(HeldSampling {
            job: TreeSamplingJob::new(index, Arc::clone(tree), Arc::clone(&statistics)),
            started: started_tx.clone(),
            release,
        }) as Box<dyn IndexSamplingJob>
    };

    let first_handle = tracker.schedule_sampling_job(held(1, &first));
    assert!(!first_handle.is_null());
    assert_eq!(started.recv_timeout(Duration::from_secs(10)), Ok(1));

    let duplicate = tracker.schedule_sampling_job(Box::new(TreeSamplingJob::new(
        1,
        Arc::clone(&first),
        Arc::clone(&statistics),
    )));
    assert!(duplicate.is_null());

    let second_handle = tracker.schedule_sampling_job(held(2, &second));
    assert!(!second_handle.is_null());
    assert_eq!(started.recv_timeout(Duration::from_secs(10)), Ok(2));
    assert_eq!(tracker.running_jobs(), vec![1, 2]);
    assert_eq!(statistics.sample(1), None);

    for release in &releases {
        release.send(()).expect("Failed to release job");
    }
    first_handle.wait().expect("Sampling job failed");
    second_handle.wait().expect("Sampling job failed");

    assert!(tracker.running_jobs().is_empty());
    assert_eq!(
        statistics.sample(1),
        Some(IndexSample {
            entries: 120,
            distinct_values: 120,
        })
    );
    assert_eq!(
        statistics.sample(2),
        Some(IndexSample {
            entries: 30,
            distinct_values: 30,
        })
    );

    // A finished index can be sampled again.
    insert_range(&first, 120..130);
    tracker
        .schedule_sampling_job(Box::new(TreeSamplingJob::new(
            1,
            Arc::clone(&first),
            Arc::clone(&statistics),
        )))
        .wait()
        .expect("Sampling job failed");
    assert_eq!(statistics.sample(1).map(|sample| sample.entries), Some(130));

    tracker.stop_and_await_all_jobs();
    let after_stop = tracker.schedule_sampling_job(Box::new(TreeSamplingJob::new(
        2,
        Arc::clone(&second),
        Arc::clone(&statistics),
    )));
    assert!(after_stop.is_null());
}

#[test]
fn test_value_prefix_counts_distinct_values() {
    let store = TestStore::new();
    let tree = index_tree(&store, 7, 64);
    let statistics = Arc::new(IndexStatisticsStore::new());

    // Keys 0..64 share their first seven big-endian bytes.
    let sample = TreeSamplingJob::new(7, Arc::clone(&tree), Arc::clone(&statistics))
        .value_prefix(7)
        .sample()
        .expect("Failed to sample");
    assert_eq!(
        sample,
        IndexSample {
            entries: 64,
            distinct_values: 1,
        }
    );
}

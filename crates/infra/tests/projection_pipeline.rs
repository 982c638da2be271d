//! End-to-end tests of the projection pipeline over the in-memory store.
//!
//! Producer -> queue -> scheduler tick -> executor -> secondary index, with a
//! manual clock so retry timing is exact.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use proptest::prelude::*;

use projector_core::{
    Clock, Counter, DataCounter, Deltas, ManualClock, NewProjectionTask, ProjectCounter,
    RetryPolicy, TargetId, TaskStatus,
};
use projector_infra::WorkerConfig;
use projector_infra::ports::{InMemoryIndex, PortCall, ProjectionPort};
use projector_infra::queue::{
    BatchScheduler, DeadLetterStore, InMemoryTaskStore, TaskExecutor, TaskProducer, TaskStore,
    TickReport, UnitOfWork,
};

/// Port that fails a fixed number of calls (or every call) before delegating
/// to an in-memory index.
struct FlakyPort<C: Counter> {
    inner: Arc<InMemoryIndex<C>>,
    failures_left: AtomicU32,
}

impl<C: Counter> FlakyPort<C> {
    fn failing(inner: Arc<InMemoryIndex<C>>, times: u32) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failures_left: AtomicU32::new(times),
        })
    }

    fn always_failing(inner: Arc<InMemoryIndex<C>>) -> Arc<Self> {
        Self::failing(inner, u32::MAX)
    }

    fn check(&self) -> anyhow::Result<()> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left == 0 {
            return Ok(());
        }
        if left != u32::MAX {
            self.failures_left.fetch_sub(1, Ordering::SeqCst);
        }
        anyhow::bail!("{} unavailable", C::INDEX_NAME)
    }
}

#[async_trait]
impl<C: Counter> ProjectionPort<C> for FlakyPort<C> {
    async fn soft_delete(&self, target_id: TargetId) -> anyhow::Result<()> {
        self.check()?;
        self.inner.soft_delete(target_id).await
    }

    async fn restore(&self, target_id: TargetId) -> anyhow::Result<()> {
        self.check()?;
        self.inner.restore(target_id).await
    }

    async fn increment(&self, target_id: TargetId, counter: C, delta: i64) -> anyhow::Result<()> {
        self.check()?;
        self.inner.increment(target_id, counter, delta).await
    }
}

struct Harness<C: Counter> {
    clock: Arc<ManualClock>,
    store: Arc<InMemoryTaskStore<C>>,
    index: Arc<InMemoryIndex<C>>,
    scheduler: BatchScheduler<C>,
    producer: TaskProducer<C>,
}

impl<C: Counter> Harness<C> {
    fn new(config: WorkerConfig) -> Self {
        Self::with_port(config, |index| index)
    }

    fn with_port<P>(config: WorkerConfig, port: impl FnOnce(Arc<InMemoryIndex<C>>) -> Arc<P>) -> Self
    where
        P: ProjectionPort<C> + 'static,
    {
        projector_observability::tracing::init_for_tests();

        let clock = Arc::new(ManualClock::at_epoch());
        let store = Arc::new(InMemoryTaskStore::with_clock(clock.clone()));
        let index = InMemoryIndex::arc();
        let executor = TaskExecutor::from_config(store.clone(), port(index.clone()), &config)
            .with_clock(clock.clone());

        Self {
            clock,
            store,
            index,
            scheduler: BatchScheduler::new(executor, &config),
            producer: TaskProducer::new(),
        }
    }

    async fn enqueue(&self, task: NewProjectionTask<C>) {
        let mut unit = self.store.unit();
        self.producer.enqueue_task(&mut unit, task).await.unwrap();
        unit.commit().await.unwrap();
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

#[tokio::test]
async fn scenario_a_successful_increment_removes_task() {
    let h = Harness::<ProjectCounter>::new(WorkerConfig::default());
    h.index.index_document(TargetId::new(42));
    h.enqueue(NewProjectionTask::for_target(TargetId::new(42)).with_delta(ProjectCounter::Like, 1))
        .await;

    let report = h.scheduler.tick().await;

    assert_eq!(report.applied, 1);
    assert!(h.store.tasks_for_target(TargetId::new(42)).await.unwrap().is_empty());
    assert_eq!(
        h.index.calls(),
        vec![PortCall::Increment {
            target_id: TargetId::new(42),
            counter: ProjectCounter::Like,
            delta: 1,
        }]
    );
}

#[tokio::test]
async fn scenario_b_soft_delete_succeeds_after_three_failures() {
    let h = Harness::<ProjectCounter>::with_port(WorkerConfig::default(), |index| {
        FlakyPort::failing(index, 3)
    });
    let target = TargetId::new(7);
    h.index.index_document(target);
    h.enqueue(NewProjectionTask::for_target(target).soft_delete()).await;

    let policy = RetryPolicy::default();
    for failures in 1..=3u32 {
        let tick_at = h.now();
        let report = h.scheduler.tick().await;
        assert_eq!(report.retried, 1, "tick {failures}");

        let task = h.store.tasks_for_target(target).await.unwrap().remove(0);
        assert_eq!(task.status, TaskStatus::Retrying);
        assert_eq!(task.retry_count, failures);
        assert_eq!(
            task.next_run_at,
            tick_at + chrono::Duration::from_std(policy.backoff(failures)).unwrap()
        );
        assert!(task.last_error.unwrap().contains("project_index unavailable"));

        // Not due yet: a tick now claims nothing.
        assert_eq!(h.scheduler.tick().await.claimed, 0);
        h.clock.advance(policy.backoff(failures));
    }

    let report = h.scheduler.tick().await;
    assert_eq!(report.applied, 1);
    assert!(h.store.tasks_for_target(target).await.unwrap().is_empty());
    assert!(h.index.document(target).unwrap().deleted);
}

#[tokio::test]
async fn scenario_c_exhausted_task_is_dead_lettered_once() {
    let h = Harness::<ProjectCounter>::with_port(WorkerConfig::default(), FlakyPort::always_failing);
    let target = TargetId::new(9);
    h.enqueue(NewProjectionTask::for_target(target).with_delta(ProjectCounter::Comment, 1))
        .await;

    let mut reports = Vec::new();
    for _ in 0..8 {
        reports.push(h.scheduler.tick().await);
        h.clock.advance(Duration::from_secs(120));
    }

    assert!(reports[..7].iter().all(|r| r.retried == 1));
    assert_eq!(reports[7].dead_lettered, 1);

    // Nothing left to process.
    assert_eq!(h.scheduler.tick().await.claimed, 0);
    assert!(h.store.tasks_for_target(target).await.unwrap().is_empty());

    let letters = h.store.dead_letters_for_target(target).await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].retry_count(), 8);
    assert_eq!(letters[0].deltas().get(ProjectCounter::Comment), 1);
    assert!(letters[0].error().contains("unavailable"));

    let stats = h.store.stats().await.unwrap();
    assert_eq!((stats.active(), stats.dead_lettered), (0, 1));
}

#[test]
fn scenario_d_default_backoff_schedule() {
    let policy = WorkerConfig::default().retry;
    let delays: Vec<u64> = (1..=8).map(|n| policy.backoff(n).as_secs()).collect();
    assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 64, 120]);
}

#[tokio::test]
async fn failing_task_does_not_revert_others_in_batch() {
    let h = Harness::<DataCounter>::new(WorkerConfig::default());
    for target in [1, 3] {
        h.index.index_document(TargetId::new(target));
    }
    for target in [1, 2, 3] {
        h.enqueue(NewProjectionTask::for_target(TargetId::new(target)).with_delta(DataCounter::Download, 1))
            .await;
    }

    let report = h.scheduler.tick().await;

    assert_eq!((report.claimed, report.applied, report.retried), (3, 2, 1));
    for target in [1, 3] {
        assert_eq!(h.index.document(TargetId::new(target)).unwrap().counter(DataCounter::Download), 1);
        assert!(h.store.tasks_for_target(TargetId::new(target)).await.unwrap().is_empty());
    }
    assert_eq!(h.store.tasks_for_target(TargetId::new(2)).await.unwrap().len(), 1);
}

#[tokio::test]
async fn applied_task_is_never_reprocessed() {
    let h = Harness::<ProjectCounter>::new(WorkerConfig::default());
    h.index.index_document(TargetId::new(1));
    h.enqueue(NewProjectionTask::for_target(TargetId::new(1)).with_delta(ProjectCounter::View, 5))
        .await;

    assert_eq!(h.scheduler.tick().await.applied, 1);
    h.clock.advance(Duration::from_secs(600));
    assert_eq!(h.scheduler.tick().await, TickReport::default());
    assert_eq!(h.index.calls().len(), 1);
    assert_eq!(h.index.document(TargetId::new(1)).unwrap().counter(ProjectCounter::View), 5);
}

#[tokio::test]
async fn negative_deltas_are_forwarded() {
    let h = Harness::<ProjectCounter>::new(WorkerConfig::default());
    let target = TargetId::new(3);
    h.index.index_document(target);
    h.enqueue(
        NewProjectionTask::for_target(target)
            .with_delta(ProjectCounter::Like, -1)
            .with_delta(ProjectCounter::View, -2),
    )
    .await;

    h.scheduler.tick().await;

    let doc = h.index.document(target).unwrap();
    assert_eq!(doc.counter(ProjectCounter::Like), -1);
    assert_eq!(doc.counter(ProjectCounter::View), -2);
}

#[tokio::test]
async fn enqueue_is_discarded_when_callers_unit_rolls_back() {
    let h = Harness::<ProjectCounter>::new(WorkerConfig::default());

    let mut unit = h.store.begin().await.unwrap();
    h.producer
        .enqueue(unit.as_mut(), TargetId::new(5), Deltas::single(ProjectCounter::Comment, 1), None)
        .await
        .unwrap();
    // The domain write that accompanied the enqueue failed.
    unit.rollback().await.unwrap();

    assert_eq!(h.scheduler.tick().await.claimed, 0);
    assert_eq!(h.store.stats().await.unwrap().active(), 0);
}

#[tokio::test]
async fn batch_flush_coalesces_view_counts() {
    let h = Harness::<ProjectCounter>::new(WorkerConfig::default());
    for target in [10, 11] {
        h.index.index_document(TargetId::new(target));
    }

    let mut unit = h.store.unit();
    let ids = h
        .producer
        .enqueue_batch(
            &mut unit,
            [
                (TargetId::new(10), ProjectCounter::View, 4),
                (TargetId::new(11), ProjectCounter::View, 0),
                (TargetId::new(10), ProjectCounter::View, 3),
                (TargetId::new(11), ProjectCounter::View, 2),
            ],
        )
        .await
        .unwrap();
    unit.commit().await.unwrap();
    assert_eq!(ids.len(), 2);

    h.scheduler.tick().await;
    assert_eq!(h.index.document(TargetId::new(10)).unwrap().counter(ProjectCounter::View), 7);
    assert_eq!(h.index.document(TargetId::new(11)).unwrap().counter(ProjectCounter::View), 2);
}

#[tokio::test]
async fn retrying_tasks_are_claimed_after_pending_ones() {
    let config = WorkerConfig::default().with_batch_size(2);
    let h = Harness::<ProjectCounter>::new(config);

    // Target 1 is missing from the index, so its task fails and retries.
    h.enqueue(NewProjectionTask::for_target(TargetId::new(1)).with_delta(ProjectCounter::Like, 1))
        .await;
    assert_eq!(h.scheduler.tick().await.retried, 1);

    for target in [2, 3] {
        h.index.index_document(TargetId::new(target));
        h.enqueue(NewProjectionTask::for_target(TargetId::new(target)).with_delta(ProjectCounter::Like, 1))
            .await;
    }
    h.clock.advance(Duration::from_secs(5));

    let claimed: Vec<_> = h
        .store
        .fetch_due(h.now(), 2)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.target_id.get())
        .collect();
    assert_eq!(claimed, vec![2, 3]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn tick_claims_at_most_batch_size_oldest_first(tasks in 0usize..40, batch_size in 1usize..15) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let remaining: Vec<i64> = rt.block_on(async {
            let h = Harness::<ProjectCounter>::new(WorkerConfig::default().with_batch_size(batch_size));
            for i in 0..tasks as i64 {
                h.index.index_document(TargetId::new(i));
                h.enqueue(NewProjectionTask::for_target(TargetId::new(i)).with_delta(ProjectCounter::Like, 1)).await;
            }

            let report = h.scheduler.tick().await;
            assert_eq!(report.claimed, tasks.min(batch_size));

            h.store.snapshot().unwrap().iter().map(|t| t.target_id.get()).collect()
        });

        let expected: Vec<i64> = (tasks.min(batch_size) as i64..tasks as i64).collect();
        prop_assert_eq!(remaining, expected);
    }
}

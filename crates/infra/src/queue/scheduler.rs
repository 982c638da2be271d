//! Batch scheduler: periodic, non-overlapping ticks that claim a bounded batch
//! of due tasks and hand them to the executor.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use projector_core::{Counter, ProjectionTask, TargetId};

use crate::config::WorkerConfig;

use super::executor::{TaskExecutor, TaskOutcome};

/// How a claimed batch is dispatched to the executor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DispatchMode {
    /// One task after another, in claim order.
    #[default]
    Sequential,
    /// Tasks are split into this many lanes by target id. Lanes run
    /// concurrently; tasks inside a lane run in claim order, so two tasks
    /// for the same target never overlap.
    TargetLanes(usize),
}

/// Summary of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct TickReport {
    /// The tick did nothing because a previous one was still running.
    pub skipped: bool,
    pub claimed: usize,
    pub applied: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub store_failures: usize,
}

impl TickReport {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    fn record(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Applied => self.applied += 1,
            TaskOutcome::Retried { .. } => self.retried += 1,
            TaskOutcome::DeadLettered { .. } => self.dead_lettered += 1,
            TaskOutcome::StoreFailed => self.store_failures += 1,
        }
    }
}

/// Cumulative scheduler statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub ticks: u64,
    pub ticks_skipped: u64,
    pub fetch_failures: u64,
    pub tasks_claimed: u64,
    pub tasks_applied: u64,
    pub tasks_retried: u64,
    pub tasks_dead_lettered: u64,
    pub store_failures: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
}

impl WorkerStats {
    fn absorb(&mut self, report: &TickReport, at: DateTime<Utc>) {
        self.ticks += 1;
        self.tasks_claimed += report.claimed as u64;
        self.tasks_applied += report.applied as u64;
        self.tasks_retried += report.retried as u64;
        self.tasks_dead_lettered += report.dead_lettered as u64;
        self.store_failures += report.store_failures as u64;
        self.last_tick_at = Some(at);
    }
}

/// Clears the running flag when a tick ends, however it ends.
struct TickGuard<'a>(&'a AtomicBool);

impl<'a> TickGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Periodic trigger for one queue.
pub struct BatchScheduler<C: Counter> {
    executor: Arc<TaskExecutor<C>>,
    batch_size: usize,
    poll_interval: Duration,
    dispatch: DispatchMode,
    running: AtomicBool,
    stats: Mutex<WorkerStats>,
}

impl<C: Counter> BatchScheduler<C> {
    /// Scheduler that claims tasks from the executor's store.
    pub fn new(executor: TaskExecutor<C>, config: &WorkerConfig) -> Self {
        Self {
            executor: Arc::new(executor),
            batch_size: config.batch_size,
            poll_interval: config.poll_interval,
            dispatch: match config.dispatch {
                // More lanes than claimed tasks never adds concurrency.
                DispatchMode::TargetLanes(n) => DispatchMode::TargetLanes(n.clamp(1, config.batch_size.max(1))),
                sequential => sequential,
            },
            running: AtomicBool::new(false),
            stats: Mutex::new(WorkerStats::default()),
        }
    }

    pub fn executor(&self) -> &TaskExecutor<C> {
        &self.executor
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn update_stats(&self, f: impl FnOnce(&mut WorkerStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut stats);
    }

    /// Run one tick: claim up to `batch_size` due tasks and execute them.
    ///
    /// Returns [`TickReport::skipped`] if another tick is still in progress.
    /// A failing task never affects the others in the batch.
    pub async fn tick(&self) -> TickReport {
        let Some(_guard) = TickGuard::acquire(&self.running) else {
            debug!(index = C::INDEX_NAME, "previous tick still running; skipping");
            self.update_stats(|s| s.ticks_skipped += 1);
            return TickReport::skipped();
        };

        let now = self.executor.clock().now();
        let batch = match self.executor.store().fetch_due(now, self.batch_size).await {
            Ok(batch) => batch,
            Err(err) => {
                error!(index = C::INDEX_NAME, error = %err, "failed to fetch due projection tasks");
                self.update_stats(|s| s.fetch_failures += 1);
                return TickReport::default();
            }
        };

        let mut report = TickReport {
            claimed: batch.len(),
            ..TickReport::default()
        };

        if !batch.is_empty() {
            match self.dispatch {
                DispatchMode::Sequential => {
                    for task in batch {
                        report.record(self.executor.execute(task).await);
                    }
                }
                DispatchMode::TargetLanes(lanes) => {
                    self.dispatch_lanes(batch, lanes, &mut report).await;
                }
            }
        }

        debug!(
            index = C::INDEX_NAME,
            claimed = report.claimed,
            applied = report.applied,
            retried = report.retried,
            dead_lettered = report.dead_lettered,
            store_failures = report.store_failures,
            "projection tick finished"
        );
        self.update_stats(|s| s.absorb(&report, now));
        report
    }

    async fn dispatch_lanes(
        &self,
        batch: Vec<ProjectionTask<C>>,
        lanes: usize,
        report: &mut TickReport,
    ) {
        let lanes = lanes.max(1);
        let mut partitions: BTreeMap<usize, Vec<ProjectionTask<C>>> = BTreeMap::new();
        for task in batch {
            partitions
                .entry(lane_for(task.target_id, lanes))
                .or_default()
                .push(task);
        }

        let mut set = JoinSet::new();
        for lane in partitions.into_values() {
            let executor = self.executor.clone();
            set.spawn(async move {
                let mut outcomes = Vec::with_capacity(lane.len());
                for task in lane {
                    outcomes.push(executor.execute(task).await);
                }
                outcomes
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcomes) => outcomes.into_iter().for_each(|o| report.record(o)),
                Err(err) => error!(index = C::INDEX_NAME, error = %err, "dispatch lane aborted"),
            }
        }
    }

    /// Start the fixed-delay loop on the current tokio runtime.
    ///
    /// Each iteration runs a tick, then waits `poll_interval` or until
    /// shutdown is requested.
    pub fn spawn(self: Arc<Self>) -> SchedulerHandle<C> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let scheduler = self.clone();

        let join = tokio::spawn(async move {
            info!(
                index = C::INDEX_NAME,
                batch_size = scheduler.batch_size,
                poll_interval_ms = scheduler.poll_interval.as_millis() as u64,
                "projection scheduler started"
            );

            while !*shutdown_rx.borrow() {
                scheduler.tick().await;

                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(scheduler.poll_interval) => {}
                }
            }

            info!(index = C::INDEX_NAME, "projection scheduler stopped");
        });

        SchedulerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            scheduler: self,
        }
    }
}

impl<C: Counter> std::fmt::Debug for BatchScheduler<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchScheduler")
            .field("index", &C::INDEX_NAME)
            .field("batch_size", &self.batch_size)
            .field("poll_interval", &self.poll_interval)
            .field("dispatch", &self.dispatch)
            .finish_non_exhaustive()
    }
}

fn lane_for(target_id: TargetId, lanes: usize) -> usize {
    target_id.get().rem_euclid(lanes as i64) as usize
}

/// Handle to a running scheduler loop. Dropping it also stops the loop,
/// after the tick in progress.
#[derive(Debug)]
pub struct SchedulerHandle<C: Counter> {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    scheduler: Arc<BatchScheduler<C>>,
}

impl<C: Counter> SchedulerHandle<C> {
    /// Request shutdown and wait for the loop to exit. A tick in progress is
    /// allowed to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                warn!(index = C::INDEX_NAME, error = %err, "projection scheduler task ended abnormally");
            }
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.scheduler.stats()
    }
}

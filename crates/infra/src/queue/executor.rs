//! Task executor: applies one task to the secondary store and records the
//! outcome with retry, backoff and dead-lettering.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use projector_core::{
    Clock, Counter, Effect, FailureDisposition, MAX_ERROR_LEN, ProjectionTask, RetryPolicy,
    SystemClock,
};

use crate::config::WorkerConfig;
use crate::ports::ProjectionPort;

use super::store::{QueueError, TaskStore, run_isolated};

/// Result of executing one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Every effect was applied and the row removed.
    Applied,
    /// The attempt failed and the task was rescheduled.
    Retried {
        retry_count: u32,
        next_run_at: DateTime<Utc>,
    },
    /// The attempt failed with no retries left; the task now lives in the
    /// dead-letter store.
    DeadLettered { retry_count: u32 },
    /// The outcome could not be persisted. The row is unchanged and will be
    /// picked up again on a later tick.
    StoreFailed,
}

/// Executes projection tasks, one at a time, each in isolation.
pub struct TaskExecutor<C: Counter> {
    store: Arc<dyn TaskStore<C>>,
    port: Arc<dyn ProjectionPort<C>>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    max_error_len: usize,
}

impl<C: Counter> TaskExecutor<C> {
    pub fn new(store: Arc<dyn TaskStore<C>>, port: Arc<dyn ProjectionPort<C>>) -> Self {
        Self {
            store,
            port,
            policy: RetryPolicy::default(),
            clock: Arc::new(SystemClock),
            max_error_len: MAX_ERROR_LEN,
        }
    }

    /// Executor using the retry policy and error length of `config`.
    pub fn from_config(
        store: Arc<dyn TaskStore<C>>,
        port: Arc<dyn ProjectionPort<C>>,
        config: &WorkerConfig,
    ) -> Self {
        Self::new(store, port)
            .with_policy(config.retry.clone())
            .with_max_error_len(config.max_error_len)
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_max_error_len(mut self, max_error_len: usize) -> Self {
        self.max_error_len = max_error_len;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub(crate) fn store(&self) -> &Arc<dyn TaskStore<C>> {
        &self.store
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Apply `task` and persist what happened.
    ///
    /// Never fails: port errors become retries or dead letters, store errors
    /// become [`TaskOutcome::StoreFailed`]. A task whose effects were applied
    /// but whose removal failed will be applied again later.
    pub async fn execute(&self, mut task: ProjectionTask<C>) -> TaskOutcome {
        let task_id = task.id;
        let target_id = task.target_id;

        let err = match self.apply(&task).await {
            Ok(()) => {
                let removed = run_isolated(self.store.as_ref(), move |unit| {
                    Box::pin(async move { unit.delete_task(task_id).await })
                })
                .await;
                return match removed {
                    Ok(()) => {
                        debug!(index = C::INDEX_NAME, target_id = %target_id, task_id = %task_id, "projection task applied");
                        TaskOutcome::Applied
                    }
                    Err(err) => self.store_failed(&task, err),
                };
            }
            Err(err) => err,
        };

        let message = format!("{err:#}");
        let now = self.clock.now();

        match task.record_failure(&message, &self.policy, now, self.max_error_len) {
            FailureDisposition::Retry {
                retry_count,
                next_run_at,
            } => {
                warn!(
                    index = C::INDEX_NAME,
                    target_id = %target_id,
                    task_id = %task_id,
                    retry_count,
                    next_run_at = %next_run_at,
                    error = %message,
                    "projection task failed; scheduled for retry"
                );

                let updated = task.clone();
                let saved = run_isolated(self.store.as_ref(), move |unit| {
                    Box::pin(async move { unit.update_task(&updated).await })
                })
                .await;

                match saved {
                    Ok(()) => TaskOutcome::Retried {
                        retry_count,
                        next_run_at,
                    },
                    Err(err) => self.store_failed(&task, err),
                }
            }
            FailureDisposition::DeadLetter(record) => {
                let retry_count = record.retry_count();
                error!(
                    index = C::INDEX_NAME,
                    target_id = %target_id,
                    task_id = %task_id,
                    retry_count,
                    dead_letter_id = %record.id(),
                    error = %message,
                    "projection task exhausted retries; moved to dead-letter store"
                );

                let moved = run_isolated(self.store.as_ref(), move |unit| {
                    Box::pin(async move {
                        unit.insert_dead_letter(&record).await?;
                        unit.delete_task(task_id).await
                    })
                })
                .await;

                match moved {
                    Ok(()) => TaskOutcome::DeadLettered { retry_count },
                    Err(err) => self.store_failed(&task, err),
                }
            }
        }
    }

    /// Issue the task's secondary-store calls in order, stopping at the
    /// first failure.
    async fn apply(&self, task: &ProjectionTask<C>) -> anyhow::Result<()> {
        for effect in task.effects() {
            match effect {
                Effect::SoftDelete => self.port.soft_delete(task.target_id).await?,
                Effect::Restore => self.port.restore(task.target_id).await?,
                Effect::Increment { counter, delta } => {
                    self.port.increment(task.target_id, counter, delta).await?
                }
            }
        }
        Ok(())
    }

    fn store_failed(&self, task: &ProjectionTask<C>, err: QueueError) -> TaskOutcome {
        error!(
            index = C::INDEX_NAME,
            target_id = %task.target_id,
            task_id = %task.id,
            retry_count = task.retry_count,
            error = %err,
            "failed to persist projection task outcome"
        );
        TaskOutcome::StoreFailed
    }
}

impl<C: Counter> std::fmt::Debug for TaskExecutor<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("index", &C::INDEX_NAME)
            .field("policy", &self.policy)
            .field("max_error_len", &self.max_error_len)
            .finish_non_exhaustive()
    }
}

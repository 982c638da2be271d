//! Queue storage boundary: task queue, units of work, dead-letter store.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use projector_core::{
    Counter, DeadLetterRecord, DomainError, NewProjectionTask, ProjectionTask, TargetId, TaskId,
};

/// Queue store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("task not found: {0}")]
    NotFound(TaskId),
    #[error("unit of work already finished")]
    Finished,
    #[error("storage error: {0}")]
    Storage(String),
    #[error("failed to decode stored row: {0}")]
    Decode(String),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Row counts of the queue and its dead-letter store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub retrying: usize,
    pub dead_lettered: usize,
}

impl QueueStats {
    pub fn active(&self) -> usize {
        self.pending + self.retrying
    }
}

/// Insert capability handed to producers.
///
/// Implemented by every [`UnitOfWork`] and by a caller-owned Postgres
/// transaction, so the enqueue commits or rolls back together with the
/// domain write that caused it.
#[async_trait]
pub trait QueueWriter<C: Counter>: Send {
    async fn insert_task(&mut self, task: NewProjectionTask<C>) -> Result<TaskId, QueueError>;
}

/// One independent transaction against the queue.
///
/// Nothing written through a unit is visible to other readers before
/// [`UnitOfWork::commit`]. Dropping an unfinished unit discards its writes.
#[async_trait]
pub trait UnitOfWork<C: Counter>: QueueWriter<C> {
    async fn delete_task(&mut self, id: TaskId) -> Result<(), QueueError>;

    /// Persist the retry state (status, retry count, last error, due time).
    async fn update_task(&mut self, task: &ProjectionTask<C>) -> Result<(), QueueError>;

    async fn insert_dead_letter(&mut self, record: &DeadLetterRecord<C>) -> Result<(), QueueError>;

    async fn commit(&mut self) -> Result<(), QueueError>;

    async fn rollback(&mut self) -> Result<(), QueueError>;
}

/// Durable queue of projection tasks for one aggregate type.
#[async_trait]
pub trait TaskStore<C: Counter>: Send + Sync {
    /// Open a new, independent unit of work.
    async fn begin(&self) -> Result<Box<dyn UnitOfWork<C>>, QueueError>;

    /// Up to `limit` active tasks with `next_run_at <= now`, ordered by
    /// `(status, next_run_at, id)`.
    async fn fetch_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProjectionTask<C>>, QueueError>;

    async fn get(&self, id: TaskId) -> Result<Option<ProjectionTask<C>>, QueueError>;

    /// Active tasks of one target, oldest first.
    async fn tasks_for_target(
        &self,
        target_id: TargetId,
    ) -> Result<Vec<ProjectionTask<C>>, QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;
}

/// Read side of the dead-letter store. Records are only ever written through
/// [`UnitOfWork::insert_dead_letter`] and never modified afterwards.
#[async_trait]
pub trait DeadLetterStore<C: Counter>: Send + Sync {
    /// Oldest records first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterRecord<C>>, QueueError>;

    async fn dead_letters_for_target(
        &self,
        target_id: TargetId,
    ) -> Result<Vec<DeadLetterRecord<C>>, QueueError>;
}

/// Future returned by work run inside [`run_isolated`].
pub type UnitFuture<'u, T> = Pin<Box<dyn Future<Output = Result<T, QueueError>> + Send + 'u>>;

/// Run `work` in its own unit of work: commit on `Ok`, roll back on `Err`.
pub async fn run_isolated<C, S, T, F>(store: &S, work: F) -> Result<T, QueueError>
where
    C: Counter,
    S: TaskStore<C> + ?Sized,
    F: for<'u> FnOnce(&'u mut (dyn UnitOfWork<C> + 'static)) -> UnitFuture<'u, T>,
{
    let mut unit = store.begin().await?;

    match work(unit.as_mut()).await {
        Ok(value) => {
            unit.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = unit.rollback().await {
                warn!(error = %rollback_err, "rollback after failed unit of work also failed");
            }
            Err(err)
        }
    }
}

#[async_trait]
impl<C: Counter, S: TaskStore<C> + ?Sized> TaskStore<C> for Arc<S> {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork<C>>, QueueError> {
        (**self).begin().await
    }

    async fn fetch_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProjectionTask<C>>, QueueError> {
        (**self).fetch_due(now, limit).await
    }

    async fn get(&self, id: TaskId) -> Result<Option<ProjectionTask<C>>, QueueError> {
        (**self).get(id).await
    }

    async fn tasks_for_target(
        &self,
        target_id: TargetId,
    ) -> Result<Vec<ProjectionTask<C>>, QueueError> {
        (**self).tasks_for_target(target_id).await
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        (**self).stats().await
    }
}

#[async_trait]
impl<C: Counter, S: DeadLetterStore<C> + ?Sized> DeadLetterStore<C> for Arc<S> {
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterRecord<C>>, QueueError> {
        (**self).dead_letters(limit).await
    }

    async fn dead_letters_for_target(
        &self,
        target_id: TargetId,
    ) -> Result<Vec<DeadLetterRecord<C>>, QueueError> {
        (**self).dead_letters_for_target(target_id).await
    }
}

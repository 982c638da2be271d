//! Task producer.
//!
//! Command services call the producer with the same writer they use for the
//! domain write, so the queue row commits or rolls back with it.

use std::collections::BTreeMap;
use std::marker::PhantomData;

use tracing::{debug, instrument};

use projector_core::{Counter, Deltas, NewProjectionTask, SoftDelete, TargetId, TaskId};

use super::store::{QueueError, QueueWriter};

/// Enqueues projection tasks for one aggregate type.
#[derive(Debug, Clone, Copy)]
pub struct TaskProducer<C: Counter> {
    _counter: PhantomData<fn() -> C>,
}

impl<C: Counter> Default for TaskProducer<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Counter> TaskProducer<C> {
    pub fn new() -> Self {
        Self {
            _counter: PhantomData,
        }
    }

    /// Insert exactly one task row through `writer`.
    pub async fn enqueue<W>(
        &self,
        writer: &mut W,
        target_id: TargetId,
        deltas: Deltas<C>,
        set_deleted: Option<SoftDelete>,
    ) -> Result<TaskId, QueueError>
    where
        W: QueueWriter<C> + ?Sized,
    {
        self.enqueue_task(writer, NewProjectionTask::new(target_id, deltas, set_deleted))
            .await
    }

    #[instrument(skip_all, fields(index = C::INDEX_NAME, target_id = %task.target_id))]
    pub async fn enqueue_task<W>(
        &self,
        writer: &mut W,
        task: NewProjectionTask<C>,
    ) -> Result<TaskId, QueueError>
    where
        W: QueueWriter<C> + ?Sized,
    {
        let id = writer.insert_task(task).await?;
        debug!(task_id = %id, "projection task enqueued");
        Ok(id)
    }

    /// Enqueue a single counter change.
    pub async fn enqueue_delta<W>(
        &self,
        writer: &mut W,
        target_id: TargetId,
        counter: C,
        delta: i64,
    ) -> Result<TaskId, QueueError>
    where
        W: QueueWriter<C> + ?Sized,
    {
        self.enqueue(writer, target_id, Deltas::single(counter, delta), None)
            .await
    }

    /// Enqueue a visibility change: `true` hides the document, `false`
    /// restores it.
    pub async fn enqueue_set_deleted<W>(
        &self,
        writer: &mut W,
        target_id: TargetId,
        deleted: bool,
    ) -> Result<TaskId, QueueError>
    where
        W: QueueWriter<C> + ?Sized,
    {
        self.enqueue(writer, target_id, Deltas::new(), Some(SoftDelete::from_flag(deleted)))
            .await
    }

    /// Bulk counter flush.
    ///
    /// Changes are coalesced per target; targets whose net change is zero get
    /// no row. Returns the ids of the inserted rows in target order.
    pub async fn enqueue_batch<W, I>(
        &self,
        writer: &mut W,
        changes: I,
    ) -> Result<Vec<TaskId>, QueueError>
    where
        W: QueueWriter<C> + ?Sized,
        I: IntoIterator<Item = (TargetId, C, i64)>,
    {
        let mut per_target: BTreeMap<TargetId, Deltas<C>> = BTreeMap::new();
        for (target_id, counter, delta) in changes {
            if delta == 0 {
                continue;
            }
            per_target.entry(target_id).or_default().add(counter, delta);
        }

        let mut ids = Vec::with_capacity(per_target.len());
        for (target_id, deltas) in per_target {
            if deltas.is_empty() {
                continue;
            }
            ids.push(self.enqueue(writer, target_id, deltas, None).await?);
        }
        Ok(ids)
    }
}

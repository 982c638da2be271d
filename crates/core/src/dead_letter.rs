//! Dead-letter records: terminal snapshots of tasks that ran out of retries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::counter::Counter;
use crate::deltas::Deltas;
use crate::id::{DeadLetterId, TargetId};
use crate::task::{ProjectionTask, SoftDelete};

/// Write-once record of an exhausted task.
///
/// There are no setters: a record is built from the task it replaces and
/// stays as written. Inspection and replay are operator concerns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct DeadLetterRecord<C: Counter> {
    id: DeadLetterId,
    target_id: TargetId,
    deltas: Deltas<C>,
    set_deleted: Option<SoftDelete>,
    retry_count: u32,
    error: String,
    created_at: DateTime<Utc>,
}

impl<C: Counter> DeadLetterRecord<C> {
    /// Snapshot `task` after its `attempts`-th failure.
    pub fn from_task(
        task: &ProjectionTask<C>,
        attempts: u32,
        error: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DeadLetterId::new(),
            target_id: task.target_id,
            deltas: task.deltas.clone(),
            set_deleted: task.set_deleted,
            retry_count: attempts,
            error,
            created_at: now,
        }
    }

    /// Rebuild a record read back from storage.
    pub fn restore(
        id: DeadLetterId,
        target_id: TargetId,
        deltas: Deltas<C>,
        set_deleted: Option<SoftDelete>,
        retry_count: u32,
        error: String,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            target_id,
            deltas,
            set_deleted,
            retry_count,
            error,
            created_at,
        }
    }

    pub fn id(&self) -> DeadLetterId {
        self.id
    }

    pub fn target_id(&self) -> TargetId {
        self.target_id
    }

    pub fn deltas(&self) -> &Deltas<C> {
        &self.deltas
    }

    pub fn set_deleted(&self) -> Option<SoftDelete> {
        self.set_deleted
    }

    /// Number of failed attempts before the task was given up on.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn error(&self) -> &str {
        &self.error
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

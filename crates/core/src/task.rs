//! Projection tasks and their retry state machine.
//!
//! ```text
//! PENDING  --success-------------------> [removed]
//! PENDING  --failure, retries remain---> RETRYING
//! RETRYING --success-------------------> [removed]
//! RETRYING --failure, retries remain---> RETRYING (retry_count + 1)
//! RETRYING --failure, exhausted--------> [dead-lettered + removed]
//! ```

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::counter::Counter;
use crate::dead_letter::DeadLetterRecord;
use crate::deltas::Deltas;
use crate::error::DomainError;
use crate::id::{TargetId, TaskId};
use crate::retry::RetryPolicy;

/// Maximum persisted length (in characters) of a failure message.
pub const MAX_ERROR_LEN: usize = 2000;

/// Status of a task that is still in the active queue.
///
/// Declaration order matches the persisted ordering (`PENDING` < `RETRYING`).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Retrying,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Retrying => "RETRYING",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TaskStatus::Pending),
            "RETRYING" => Ok(TaskStatus::Retrying),
            other => Err(DomainError::UnknownStatus(other.to_string())),
        }
    }
}

impl core::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Visibility change carried by a task. Absent means "leave as is".
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SoftDelete {
    Delete,
    Restore,
}

impl SoftDelete {
    /// Map the persisted `set_deleted` flag.
    pub fn from_flag(deleted: bool) -> Self {
        if deleted { SoftDelete::Delete } else { SoftDelete::Restore }
    }

    pub fn as_flag(&self) -> bool {
        matches!(self, SoftDelete::Delete)
    }
}

/// One secondary-store call derived from a task.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Effect<C: Counter> {
    SoftDelete,
    Restore,
    Increment { counter: C, delta: i64 },
}

/// A task as handed to the producer, before the store assigns an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct NewProjectionTask<C: Counter> {
    pub target_id: TargetId,
    pub deltas: Deltas<C>,
    pub set_deleted: Option<SoftDelete>,
}

impl<C: Counter> NewProjectionTask<C> {
    pub fn new(target_id: TargetId, deltas: Deltas<C>, set_deleted: Option<SoftDelete>) -> Self {
        Self {
            target_id,
            deltas,
            set_deleted,
        }
    }

    pub fn for_target(target_id: TargetId) -> Self {
        Self::new(target_id, Deltas::new(), None)
    }

    pub fn with_delta(mut self, counter: C, delta: i64) -> Self {
        self.deltas.add(counter, delta);
        self
    }

    pub fn soft_delete(mut self) -> Self {
        self.set_deleted = Some(SoftDelete::Delete);
        self
    }

    pub fn restore(mut self) -> Self {
        self.set_deleted = Some(SoftDelete::Restore);
        self
    }

    /// Whether applying this task would touch the secondary store at all.
    pub fn has_effect(&self) -> bool {
        self.set_deleted.is_some() || !self.deltas.is_empty()
    }

    /// Materialize the queue row as the store persists it.
    pub fn into_task(self, id: TaskId, now: DateTime<Utc>) -> ProjectionTask<C> {
        ProjectionTask {
            id,
            target_id: self.target_id,
            deltas: self.deltas,
            set_deleted: self.set_deleted,
            status: TaskStatus::Pending,
            retry_count: 0,
            next_run_at: now,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// An active queue row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct ProjectionTask<C: Counter> {
    pub id: TaskId,
    pub target_id: TargetId,
    pub deltas: Deltas<C>,
    pub set_deleted: Option<SoftDelete>,
    pub status: TaskStatus,
    /// Failures recorded so far
    pub retry_count: u32,
    /// Not eligible for execution before this instant
    pub next_run_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What a failed attempt turned the task into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDisposition<C: Counter> {
    /// The task stays queued; it has already been updated in place.
    Retry {
        retry_count: u32,
        next_run_at: DateTime<Utc>,
    },
    /// Retries are exhausted; persist the record and remove the task.
    DeadLetter(DeadLetterRecord<C>),
}

impl<C: Counter> ProjectionTask<C> {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_run_at <= now
    }

    /// Polling order key: `(status, next_run_at, id)`.
    pub fn poll_key(&self) -> (TaskStatus, DateTime<Utc>, TaskId) {
        (self.status, self.next_run_at, self.id)
    }

    /// Secondary-store calls in application order: visibility first, then
    /// every non-zero counter in schema order, negative deltas included.
    pub fn effects(&self) -> Vec<Effect<C>> {
        let visibility = self.set_deleted.map(|s| match s {
            SoftDelete::Delete => Effect::SoftDelete,
            SoftDelete::Restore => Effect::Restore,
        });
        visibility
            .into_iter()
            .chain(
                self.deltas
                    .iter()
                    .map(|(counter, delta)| Effect::Increment { counter, delta }),
            )
            .collect()
    }

    /// Apply the outcome of a failed attempt.
    ///
    /// With retries remaining the task moves to `RETRYING` with its counter,
    /// error and due time updated. Otherwise the task is left untouched and a
    /// dead-letter snapshot is returned.
    pub fn record_failure(
        &mut self,
        error: &str,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
        max_error_len: usize,
    ) -> FailureDisposition<C> {
        let next = self.retry_count.saturating_add(1);
        let error = truncate_error(error, max_error_len);

        if policy.is_exhausted(next) {
            return FailureDisposition::DeadLetter(DeadLetterRecord::from_task(self, next, error, now));
        }

        let delay = chrono::Duration::from_std(policy.backoff(next))
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::from(u32::MAX)));

        self.status = TaskStatus::Retrying;
        self.retry_count = next;
        self.last_error = Some(error);
        self.next_run_at = now + delay;
        self.updated_at = now;

        FailureDisposition::Retry {
            retry_count: self.retry_count,
            next_run_at: self.next_run_at,
        }
    }
}

/// Cut `msg` down to at most `max_chars` characters.
pub fn truncate_error(msg: &str, max_chars: usize) -> String {
    match msg.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => msg[..byte_idx].to_string(),
        None => msg.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::{DataCounter, ProjectCounter};
    use std::time::Duration;

    fn epoch() -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH
    }

    fn pending(new: NewProjectionTask<ProjectCounter>) -> ProjectionTask<ProjectCounter> {
        new.into_task(TaskId::new(1), epoch())
    }

    #[test]
    fn new_task_starts_pending_and_due() {
        let task = pending(NewProjectionTask::for_target(TargetId::new(42)).with_delta(ProjectCounter::Like, 1));

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
        assert!(task.last_error.is_none());
        assert!(task.is_due(epoch()));
    }

    #[test]
    fn effects_put_visibility_first_and_keep_signs() {
        let task = pending(
            NewProjectionTask::for_target(TargetId::new(7))
                .with_delta(ProjectCounter::View, 3)
                .with_delta(ProjectCounter::Comment, -1)
                .soft_delete(),
        );

        assert_eq!(
            task.effects(),
            vec![
                Effect::SoftDelete,
                Effect::Increment { counter: ProjectCounter::Comment, delta: -1 },
                Effect::Increment { counter: ProjectCounter::View, delta: 3 },
            ]
        );
    }

    #[test]
    fn task_without_effect_is_detectable() {
        let empty = NewProjectionTask::<DataCounter>::for_target(TargetId::new(1))
            .with_delta(DataCounter::Download, 0);
        assert!(!empty.has_effect());
        assert!(empty.clone().restore().has_effect());
    }

    #[test]
    fn failure_with_retries_left_moves_to_retrying() {
        let policy = RetryPolicy::default();
        let mut task = pending(NewProjectionTask::for_target(TargetId::new(7)).soft_delete());

        let now = epoch() + chrono::Duration::seconds(10);
        let outcome = task.record_failure("index unavailable", &policy, now, MAX_ERROR_LEN);

        assert_eq!(
            outcome,
            FailureDisposition::Retry {
                retry_count: 1,
                next_run_at: now + chrono::Duration::seconds(1),
            }
        );
        assert_eq!(task.status, TaskStatus::Retrying);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.last_error.as_deref(), Some("index unavailable"));
        assert_eq!(task.updated_at, now);
    }

    #[test]
    fn exhausted_failure_yields_dead_letter_and_leaves_task() {
        let policy = RetryPolicy::default().with_max_retry(2);
        let mut task = pending(NewProjectionTask::for_target(TargetId::new(9)).with_delta(ProjectCounter::Comment, 1));
        task.retry_count = 1;
        let before = task.clone();

        match task.record_failure("boom", &policy, epoch(), MAX_ERROR_LEN) {
            FailureDisposition::DeadLetter(record) => {
                assert_eq!(record.target_id(), TargetId::new(9));
                assert_eq!(record.retry_count(), 2);
                assert_eq!(record.error(), "boom");
                assert_eq!(record.deltas().get(ProjectCounter::Comment), 1);
            }
            other => panic!("expected dead letter, got {other:?}"),
        }
        assert_eq!(task, before);
    }

    #[test]
    fn retry_delays_follow_policy() {
        let policy = RetryPolicy::default();
        let mut task = pending(NewProjectionTask::for_target(TargetId::new(1)).restore());

        for n in 1..8u32 {
            let now = epoch() + chrono::Duration::minutes(i64::from(n));
            task.record_failure("err", &policy, now, MAX_ERROR_LEN);
            assert_eq!(task.retry_count, n);
            assert_eq!(
                task.next_run_at - now,
                chrono::Duration::from_std(policy.backoff(n)).unwrap()
            );
        }
        assert_eq!(policy.backoff(7), Duration::from_secs(64));
    }

    #[test]
    fn truncation_is_character_based() {
        assert_eq!(truncate_error("short", 10), "short");
        assert_eq!(truncate_error("abcdef", 3), "abc");
        assert_eq!(truncate_error("ééé", 2), "éé");

        let long = "x".repeat(5000);
        assert_eq!(truncate_error(&long, MAX_ERROR_LEN).chars().count(), MAX_ERROR_LEN);
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [TaskStatus::Pending, TaskStatus::Retrying] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("DONE".parse::<TaskStatus>().is_err());
        assert!(TaskStatus::Pending < TaskStatus::Retrying);
    }
}

//! `projector-core` — domain model of the projection queue.
//!
//! Pure types and state transitions only: identifiers, delta schemas, the
//! task retry state machine, backoff, and dead-letter records. Storage,
//! scheduling and the secondary store live in `projector-infra`.

pub mod clock;
pub mod counter;
pub mod dead_letter;
pub mod deltas;
pub mod error;
pub mod id;
pub mod retry;
pub mod task;

pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::{Counter, DataCounter, ProjectCounter};
pub use dead_letter::DeadLetterRecord;
pub use deltas::Deltas;
pub use error::{DomainError, DomainResult};
pub use id::{DeadLetterId, TargetId, TaskId};
pub use retry::{BackoffStrategy, DEFAULT_MAX_RETRY, RetryPolicy};
pub use task::{
    Effect, FailureDisposition, MAX_ERROR_LEN, NewProjectionTask, ProjectionTask, SoftDelete,
    TaskStatus, truncate_error,
};

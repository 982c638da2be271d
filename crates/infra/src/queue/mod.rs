//! Projection queue: durable tasks that keep a secondary store in sync with
//! the primary one.
//!
//! ## Design
//!
//! - Tasks are written in the same transaction as the domain change
//! - One generic engine, parameterized by the aggregate's counter schema
//! - Each task is applied and settled in its own unit of work
//! - Retry with capped exponential backoff, then a write-once dead-letter store
//!
//! ## Components
//!
//! - `TaskProducer`: enqueues tasks through the caller's writer
//! - `TaskStore` / `DeadLetterStore`: persistence (in-memory or Postgres)
//! - `TaskExecutor`: applies one task and records the outcome
//! - `BatchScheduler`: periodic, non-overlapping batch ticks

pub mod executor;
pub mod memory;
pub mod postgres;
pub mod producer;
pub mod scheduler;
pub mod store;

pub use executor::{TaskExecutor, TaskOutcome};
pub use memory::{InMemoryTaskStore, InMemoryUnit};
pub use postgres::{PgUnitOfWork, PostgresTaskStore};
pub use producer::TaskProducer;
pub use scheduler::{BatchScheduler, DispatchMode, SchedulerHandle, TickReport, WorkerStats};
pub use store::{
    DeadLetterStore, QueueError, QueueStats, QueueWriter, TaskStore, UnitFuture, UnitOfWork,
    run_isolated,
};

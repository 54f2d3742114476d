//! Durable task queue for work that happens after a webhook is acknowledged.
//!
//! ## Design
//!
//! - Webhook handlers enqueue a task and return; a worker applies it
//! - Retry policy with backoff; handlers report retryable vs permanent failures
//! - Exhausted tasks land in the dead-letter list for manual reconciliation
//! - Postgres claims with `FOR UPDATE SKIP LOCKED`, so several workers can share a table
//!
//! ## Components
//!
//! - [`Task`]: payload plus retry bookkeeping
//! - [`TaskQueue`]: persistence (in-memory or Postgres)
//! - [`TaskWorker`]: claims tasks and runs them through a [`TaskHandler`]

mod postgres;
pub mod queue;
pub mod types;
pub mod worker;

pub use postgres::PostgresTaskQueue;
pub use queue::{InMemoryTaskQueue, QueueStats, TaskQueue, TaskQueueError};
pub use types::{
    BackoffStrategy, DeadLetterEntry, RetryPolicy, Task, TaskId, TaskKind, TaskResult, TaskStatus,
};
pub use worker::{
    TaskHandler, TaskOutcome, TaskWorker, TaskWorkerConfig, TaskWorkerHandle, WorkerStats,
};

//! The job queue engine.
//!
//! Leaf-first: [`job`] (model and payloads), [`retry`] (backoff policy),
//! [`batch`] (aggregate progress), [`executor`] (runs one job),
//! [`dispatcher`] (the tick handler) and [`service`] (the public API).

pub mod batch;
pub mod dispatcher;
pub mod executor;
pub mod job;
pub mod retry;
pub mod service;

pub use batch::{Batch, BatchProgress, BatchStatus, BatchTracker};
pub use dispatcher::{
    Dispatcher, DispatcherConfig, ExecutionMode, SkipReason, SweepSummary, TickReport, TickSummary,
};
pub use executor::{ExecutionFailure, ExecutionOutcome, ExecutorConfig, JobExecutor};
pub use job::{BulkPayload, ErrorKind, GenerationPayload, Job, JobAction, JobStatus, NewJob};
pub use retry::{RetryDecision, RetryPolicy};
pub use service::{Queue, QueueBuilder, QueueStats, SubmitOptions};

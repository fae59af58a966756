//! Background job queue: database-backed, at-least-once, multi-tenant.
//!
//! ## Design
//!
//! - Jobs are tenant-scoped and typed against a closed set of work kinds,
//!   each with pinned scheduling defaults
//! - Delayed execution (`run_at`) and strict priority ordering with FIFO
//!   tiebreak
//! - Claiming is a conditional status-guarded update, so any number of
//!   worker processes can poll the same table safely
//! - Exponential backoff on retry, terminal `failed` at the attempt cap
//! - Retention soft-archives old terminal jobs; rows are never deleted
//!
//! ## Components
//!
//! - [`Job`]/[`JobType`]/[`JobStatus`]: the persisted record and its policies
//! - [`JobStore`]: persistence (in-memory or Postgres)
//! - [`JobQueue`]: enqueue, claim protocol, lifecycle transitions, retention
//! - [`JobWorker`]: polling loop driving registered handlers

pub mod postgres;
pub mod service;
pub mod store;
pub mod types;
pub mod worker;

pub use postgres::PostgresJobStore;
pub use service::{ARCHIVE_REASON, CompletionPolicy, JobQueue, QueueError};
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use types::{EnqueueOptions, Job, JobDefaults, JobRequest, JobStatus, JobType, backoff_delay};
pub use worker::{
    BatchOutcome, HandlerOutcome, JobWorker, JobWorkerConfig, JobWorkerHandle, WorkerStats,
};

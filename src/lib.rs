#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod arguments;
mod batch_runner;
mod batched_job;
pub mod batching;
pub mod cli;
mod cursor;
mod errors;
mod finalizer;
mod job_registry;
mod registration;
mod runner;
mod scheduler;
pub mod schema;
mod status;
mod storage;
pub mod testing;
mod util;
mod worker;

pub use self::arguments::JobArguments;
/// The trait implemented by data transformations.
pub use self::batched_job::{BatchedMigrationJob, SubBatch};
pub use self::cursor::{BatchRange, Cursor, quote_ident};
pub use self::errors::{Error, Result};
pub use self::finalizer::{FinalizeOutcome, Finalizer, ensure_finished, partitions_of};
pub use self::registration::{
    DEFAULT_BATCH_SIZE, DEFAULT_GITLAB_SCHEMA, DEFAULT_PAUSE_MS, DEFAULT_SUB_BATCH_SIZE,
    MIN_INTERVAL, QueueMigration, QueueOutcome, SkipReason, delete_job_tracking, delete_migration,
    find, find_by_id,
    is_scheduled, list, normalize_legacy_job_arguments, pause, progress, progress_by_id, resume,
    retry_failed, status,
};
/// The runner that starts background workers.
pub use self::runner::{Configured, RunHandle, Runner, Unconfigured};
pub use self::scheduler::{
    DelayedBatch, DelayedQueue, PlannedBatch, PostgresQueue, Schedule, Scheduler,
};
pub use self::schema::{BatchedJob, BatchedMigration, MigrationIdentity, Progress};
pub use self::status::{JobStatus, MigrationStatus};
pub use self::storage::setup_database;

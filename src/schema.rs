//! Database records for batched migrations and their batches.

use crate::arguments::JobArguments;
use crate::cursor::{BatchRange, Cursor};
use crate::status::{JobStatus, MigrationStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use sqlx::types::Json;
use std::fmt;
use std::time::Duration;

/// Columns selected whenever a [`BatchedMigration`] is loaded.
pub(crate) const MIGRATION_COLUMNS: &str = "id, job_class_name, table_name, column_names, \
     job_arguments, min_cursor, max_cursor, batch_size, sub_batch_size, max_batch_size, \
     interval_seconds, pause_ms, status, gitlab_schema, total_tuple_count, created_at, \
     updated_at, started_at, finished_at";

/// Columns selected whenever a [`BatchedJob`] is loaded.
pub(crate) const JOB_COLUMNS: &str = "id, batched_background_migration_id, min_value, \
     max_value, batch_size, sub_batch_size, status, attempts, run_at, started_at, \
     finished_at, last_error";

/// One registered batched migration.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct BatchedMigration {
    /// Unique identifier
    pub id: i64,
    /// Name of the transformation that processes each batch
    pub job_class_name: String,
    /// Table being walked
    pub table_name: String,
    /// Cursor columns, in ordering priority
    pub column_names: Vec<String>,
    /// Arguments passed to the transformation
    pub job_arguments: Json<JobArguments>,
    /// First cursor position covered
    pub min_cursor: Vec<i64>,
    /// Last cursor position covered
    pub max_cursor: Vec<i64>,
    /// Rows per batch
    pub batch_size: i32,
    /// Rows per sub-batch; tuned while the migration runs
    pub sub_batch_size: i32,
    /// Ceiling for sub-batch growth
    pub max_batch_size: Option<i32>,
    /// Seconds between batch dispatches
    pub interval_seconds: i32,
    /// Milliseconds to sleep between sub-batches
    pub pause_ms: i32,
    /// Lifecycle status
    pub status: MigrationStatus,
    /// Logical database the table lives in
    pub gitlab_schema: String,
    /// Row count estimate taken at registration
    pub total_tuple_count: Option<i64>,
    /// Registration time
    pub created_at: DateTime<Utc>,
    /// Time of the last status change
    pub updated_at: DateTime<Utc>,
    /// Time the first batch started
    pub started_at: Option<DateTime<Utc>>,
    /// Time the migration finished or was finalized
    pub finished_at: Option<DateTime<Utc>>,
}

impl BatchedMigration {
    /// The identity tuple of this migration.
    pub fn identity(&self) -> MigrationIdentity {
        MigrationIdentity {
            job_class_name: self.job_class_name.clone(),
            table_name: self.table_name.clone(),
            column_names: self.column_names.clone(),
            job_arguments: self.job_arguments.0.clone(),
        }
    }

    /// Cursor range the migration must cover.
    pub fn bounds(&self) -> BatchRange {
        BatchRange {
            min: Cursor::new(self.min_cursor.clone()),
            max: Cursor::new(self.max_cursor.clone()),
        }
    }

    /// Minimum delay between two batch dispatches.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(u64::try_from(self.interval_seconds).unwrap_or_default())
    }

    /// Pause between two sub-batches.
    pub fn pause(&self) -> Duration {
        Duration::from_millis(u64::try_from(self.pause_ms).unwrap_or_default())
    }
}

/// One batch of a [`BatchedMigration`], and its execution log.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct BatchedJob {
    /// Unique identifier
    pub id: i64,
    /// Owning migration
    pub batched_background_migration_id: i64,
    /// First key of the batch
    pub min_value: Vec<i64>,
    /// Last key of the batch
    pub max_value: Vec<i64>,
    /// Rows in the batch when it was planned
    pub batch_size: i32,
    /// Sub-batch size used by the latest attempt
    pub sub_batch_size: i32,
    /// Outcome of the latest attempt
    pub status: JobStatus,
    /// Number of attempts made
    pub attempts: i32,
    /// Earliest time the batch may run
    pub run_at: DateTime<Utc>,
    /// Start of the latest attempt
    pub started_at: Option<DateTime<Utc>>,
    /// End of the latest attempt
    pub finished_at: Option<DateTime<Utc>>,
    /// Error of the latest failed attempt
    pub last_error: Option<String>,
}

impl BatchedJob {
    /// Key range covered by this batch.
    pub fn range(&self) -> BatchRange {
        BatchRange {
            min: Cursor::new(self.min_value.clone()),
            max: Cursor::new(self.max_value.clone()),
        }
    }
}

/// The tuple that identifies a batched migration.
///
/// At most one migration exists per identity; registering the same
/// identity again is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationIdentity {
    /// Name of the transformation
    pub job_class_name: String,
    /// Table being walked
    pub table_name: String,
    /// Cursor columns
    pub column_names: Vec<String>,
    /// Transformation arguments
    pub job_arguments: JobArguments,
}

impl MigrationIdentity {
    /// Identity of a single-column migration without arguments.
    pub fn new(
        job_class_name: impl Into<String>,
        table_name: impl Into<String>,
        column_name: impl Into<String>,
    ) -> Self {
        Self {
            job_class_name: job_class_name.into(),
            table_name: table_name.into(),
            column_names: vec![column_name.into()],
            job_arguments: JobArguments::empty(),
        }
    }

    /// Replace the cursor columns, for composite cursors.
    pub fn columns<I, S>(mut self, column_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.column_names = column_names.into_iter().map(Into::into).collect();
        self
    }

    /// Set the transformation arguments.
    pub fn arguments(mut self, job_arguments: impl Into<JobArguments>) -> Self {
        self.job_arguments = job_arguments.into();
        self
    }

    /// The same identity, pointed at another physical table.
    pub fn for_table(&self, table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            ..self.clone()
        }
    }

    /// Operator command that finalizes this migration.
    pub fn finalize_command(&self) -> String {
        format!(
            "batched-migrations finalize {} {} {} '{}'",
            self.job_class_name,
            self.table_name,
            self.column_names.join(","),
            self.job_arguments.to_value()
        )
    }
}

impl fmt::Display for MigrationIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{job_class_name: {}, table_name: {}, column_names: [{}], job_arguments: {}}}",
            self.job_class_name,
            self.table_name,
            self.column_names.join(", "),
            self.job_arguments.to_value()
        )
    }
}

/// Batch counts for one migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, FromRow)]
pub struct Progress {
    /// Batches planned
    pub total_batches: i64,
    /// Batches that succeeded
    pub succeeded_batches: i64,
    /// Batches whose latest attempt failed
    pub failed_batches: i64,
    /// Row count estimate taken at registration
    pub total_tuple_count: Option<i64>,
}

impl Progress {
    /// Share of succeeded batches, between 0 and 100.
    pub fn percent_complete(&self) -> f64 {
        if self.total_batches == 0 {
            return 100.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let ratio = self.succeeded_batches as f64 / self.total_batches as f64;
        ratio * 100.0
    }
}

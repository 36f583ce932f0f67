//! Registering batched migrations, and the operations that query and steer them afterwards.

use crate::arguments::JobArguments;
use crate::batching::{self, TableCheck};
use crate::cursor::{BatchRange, Cursor};
use crate::errors::{Error, Result};
use crate::scheduler::{PostgresQueue, Scheduler};
use crate::schema::{BatchedMigration, MigrationIdentity, Progress};
use crate::status::{JobStatus, MigrationStatus};
use crate::storage::{self, NewMigration};
use chrono::Utc;
use serde::Serialize;
use sqlx::PgPool;
use std::fmt;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Rows per batch unless configured otherwise.
pub const DEFAULT_BATCH_SIZE: i32 = 1_000;
/// Rows per sub-batch unless configured otherwise.
pub const DEFAULT_SUB_BATCH_SIZE: i32 = 100;
/// Shortest allowed delay between two batches, also the default.
pub const MIN_INTERVAL: Duration = Duration::from_secs(2 * 60);
/// Pause between sub-batches unless configured otherwise.
pub const DEFAULT_PAUSE_MS: i32 = 100;
/// Logical database migrations run against unless configured otherwise.
pub const DEFAULT_GITLAB_SCHEMA: &str = "gitlab_main";

/// Builder for registering a batched migration.
///
/// ```no_run
/// # use batched_migrations::QueueMigration;
/// # use serde_json::json;
/// # async fn example(pool: sqlx::PgPool) -> batched_migrations::Result<()> {
/// QueueMigration::new("CopyColumnUsingBackgroundMigrationJob", "events", "id")
///     .job_arguments(json!([["id"], ["id_convert_to_bigint"]]))
///     .batch_size(10_000)
///     .sub_batch_size(500)
///     .queue(&pool)
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct QueueMigration {
    identity: MigrationIdentity,
    batch_size: i32,
    sub_batch_size: i32,
    max_batch_size: Option<i32>,
    interval: Duration,
    initial_delay: Duration,
    pause_ms: i32,
    batch_min_value: Option<Cursor>,
    batch_max_value: Option<Cursor>,
    gitlab_schema: String,
    status: MigrationStatus,
}

/// What [`QueueMigration::queue`] did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum QueueOutcome {
    /// The migration was created and its batches queued.
    Scheduled {
        /// Migration id
        id: i64,
        /// Number of queued batches
        batches: usize,
        /// Delay of the last batch
        final_delay: Duration,
    },
    /// A migration with the same identity already exists; nothing changed.
    AlreadyQueued {
        /// Id of the existing migration
        id: i64,
    },
    /// The table holds no rows to migrate; the migration was created finished.
    Empty {
        /// Migration id
        id: i64,
    },
    /// The table or a cursor column does not exist; nothing was created.
    Skipped {
        /// Why the migration was not created
        reason: SkipReason,
    },
}

impl QueueOutcome {
    /// Id of the migration record, when one exists.
    pub fn id(&self) -> Option<i64> {
        match self {
            Self::Scheduled { id, .. } | Self::AlreadyQueued { id } | Self::Empty { id } => Some(*id),
            Self::Skipped { .. } => None,
        }
    }
}

/// Unmet precondition that prevented a registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The table does not exist.
    MissingTable(String),
    /// The cursor column does not exist.
    MissingColumn(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingTable(table) => write!(f, "table {table} does not exist"),
            Self::MissingColumn(column) => write!(f, "column {column} does not exist"),
        }
    }
}

impl QueueMigration {
    /// Start registering `job_class_name` over `column_name` of `table_name`.
    pub fn new(
        job_class_name: impl Into<String>,
        table_name: impl Into<String>,
        column_name: impl Into<String>,
    ) -> Self {
        Self::from_identity(MigrationIdentity::new(job_class_name, table_name, column_name))
    }

    /// Start registering the migration identified by `identity`.
    pub fn from_identity(identity: MigrationIdentity) -> Self {
        Self {
            identity,
            batch_size: DEFAULT_BATCH_SIZE,
            sub_batch_size: DEFAULT_SUB_BATCH_SIZE,
            max_batch_size: None,
            interval: MIN_INTERVAL,
            initial_delay: Duration::ZERO,
            pause_ms: DEFAULT_PAUSE_MS,
            batch_min_value: None,
            batch_max_value: None,
            gitlab_schema: DEFAULT_GITLAB_SCHEMA.to_string(),
            status: MigrationStatus::Active,
        }
    }

    /// Walk the table by a composite cursor instead of a single column.
    pub fn columns<I, S>(mut self, column_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.identity = self.identity.columns(column_names);
        self
    }

    /// Arguments handed to the transformation. Flat shapes are normalized.
    pub fn job_arguments(mut self, job_arguments: impl Into<JobArguments>) -> Self {
        self.identity = self.identity.arguments(job_arguments);
        self
    }

    /// Rows per batch.
    pub fn batch_size(mut self, batch_size: i32) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Rows per sub-batch, the unit of one transaction.
    pub fn sub_batch_size(mut self, sub_batch_size: i32) -> Self {
        self.sub_batch_size = sub_batch_size;
        self
    }

    /// Upper bound for the sub-batch size when it is grown after fast batches.
    pub fn max_batch_size(mut self, max_batch_size: i32) -> Self {
        self.max_batch_size = Some(max_batch_size);
        self
    }

    /// Delay between two batches. Values below [`MIN_INTERVAL`] are raised to it.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Extra delay before the first batch.
    pub fn initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    /// Pause between sub-batches, in milliseconds.
    pub fn pause_ms(mut self, pause_ms: i32) -> Self {
        self.pause_ms = pause_ms;
        self
    }

    /// Skip rows whose cursor is below `min`.
    pub fn batch_min_value(mut self, min: impl Into<Cursor>) -> Self {
        self.batch_min_value = Some(min.into());
        self
    }

    /// Skip rows whose cursor is above `max`.
    pub fn batch_max_value(mut self, max: impl Into<Cursor>) -> Self {
        self.batch_max_value = Some(max.into());
        self
    }

    /// Logical database the migration belongs to.
    pub fn gitlab_schema(mut self, gitlab_schema: impl Into<String>) -> Self {
        self.gitlab_schema = gitlab_schema.into();
        self
    }

    /// Register the migration paused; workers ignore it until resumed.
    pub fn paused(mut self) -> Self {
        self.status = MigrationStatus::Paused;
        self
    }

    /// The identity this builder registers.
    pub fn identity(&self) -> &MigrationIdentity {
        &self.identity
    }

    fn effective_interval(&self) -> Duration {
        self.interval.max(MIN_INTERVAL)
    }

    fn validate(&self) -> Result<()> {
        let invalid = |message: String| Err(Error::InvalidConfiguration(message));
        let arity = self.identity.column_names.len();

        if arity == 0 {
            return invalid("at least one cursor column is required".into());
        }
        if self.batch_size <= 0 {
            return invalid(format!("batch_size must be positive, got {}", self.batch_size));
        }
        if self.sub_batch_size <= 0 || self.sub_batch_size > self.batch_size {
            return invalid(format!(
                "sub_batch_size must be between 1 and batch_size ({}), got {}",
                self.batch_size, self.sub_batch_size
            ));
        }
        if let Some(max) = self.max_batch_size.filter(|max| *max < self.sub_batch_size) {
            return invalid(format!(
                "max_batch_size ({max}) must not be below sub_batch_size ({})",
                self.sub_batch_size
            ));
        }
        if self.pause_ms < 0 {
            return invalid(format!("pause_ms must not be negative, got {}", self.pause_ms));
        }
        for cursor in [&self.batch_min_value, &self.batch_max_value].into_iter().flatten() {
            if cursor.arity() != arity {
                return invalid(format!(
                    "cursor {cursor} does not match the {arity} cursor column(s)"
                ));
            }
        }
        if let (Some(min), Some(max)) = (&self.batch_min_value, &self.batch_max_value) {
            if min > max {
                return invalid(format!("batch_min_value {min} is above batch_max_value {max}"));
            }
        }
        if i32::try_from(self.effective_interval().as_secs()).is_err() {
            return invalid(format!("interval {:?} is too long", self.interval));
        }

        Ok(())
    }

    /// Create the migration and queue all its batches.
    ///
    /// Registering an identity that already exists changes nothing and
    /// returns [`QueueOutcome::AlreadyQueued`]. A missing table or column
    /// is not an error: nothing is created and [`QueueOutcome::Skipped`]
    /// is returned.
    #[instrument(
        name = "batched_migrations.queue",
        skip_all,
        fields(
            migration.job_class_name = %self.identity.job_class_name,
            migration.table_name = %self.identity.table_name,
        )
    )]
    pub async fn queue(&self, pool: &PgPool) -> Result<QueueOutcome> {
        self.validate()?;
        let identity = &self.identity;

        let reason = match batching::check_table(pool, &identity.table_name, &identity.column_names).await? {
            TableCheck::Ready => None,
            TableCheck::MissingTable => Some(SkipReason::MissingTable(identity.table_name.clone())),
            TableCheck::MissingColumn(column) => Some(SkipReason::MissingColumn(column)),
        };
        if let Some(reason) = reason {
            info!(%reason, "Not scheduling batched migration: {identity}");
            return Ok(QueueOutcome::Skipped { reason });
        }

        if let Some(existing) = storage::find_migration(pool, identity).await? {
            info!(migration.id = existing.id, "Batched migration is already queued");
            return Ok(QueueOutcome::AlreadyQueued { id: existing.id });
        }

        let bounds = self.bounds(pool).await?;
        let total_tuple_count = batching::estimate_tuple_count(pool, &identity.table_name).await?;
        let now = Utc::now();

        let empty_bounds = || {
            let min = self
                .batch_min_value
                .clone()
                .unwrap_or_else(|| Cursor::zero(identity.column_names.len()));
            BatchRange {
                min: min.clone(),
                max: min,
            }
        };
        let interval_seconds = i32::try_from(self.effective_interval().as_secs())
            .map_err(|_| Error::InvalidConfiguration("interval is too long".into()))?;

        let recorded_bounds = bounds.clone().unwrap_or_else(empty_bounds);

        let mut tx = pool.begin().await?;
        let new_migration = NewMigration {
            identity,
            bounds: &recorded_bounds,
            batch_size: self.batch_size,
            sub_batch_size: self.sub_batch_size,
            max_batch_size: self.max_batch_size,
            interval_seconds,
            pause_ms: self.pause_ms,
            status: self.status,
            gitlab_schema: &self.gitlab_schema,
            total_tuple_count,
            created_at: now,
        };
        let Some(migration) = storage::insert_migration(&mut tx, &new_migration).await? else {
            tx.rollback().await?;
            let existing = storage::find_migration(pool, identity)
                .await?
                .ok_or_else(|| Error::InvalidConfiguration(format!("lost registration of {identity}")))?;
            info!(migration.id = existing.id, "Batched migration was queued concurrently");
            return Ok(QueueOutcome::AlreadyQueued { id: existing.id });
        };

        if bounds.is_none() {
            storage::mark_finished_tx(&mut tx, migration.id).await?;
            tx.commit().await?;
            info!(migration.id = migration.id, "Table has no rows to migrate, batched migration finished");
            return Ok(QueueOutcome::Empty { id: migration.id });
        }

        // Registration holds a single connection: keys are read through `tx`
        let planned = Scheduler::new(now)
            .initial_delay(self.initial_delay)
            .plan(&mut tx, &migration)
            .await?;
        let schedule = Scheduler::dispatch(planned, &mut PostgresQueue::new(&mut tx)).await?;

        if schedule.batches == 0 {
            storage::mark_finished_tx(&mut tx, migration.id).await?;
            tx.commit().await?;
            info!(migration.id = migration.id, "Rows vanished before scheduling, batched migration finished");
            return Ok(QueueOutcome::Empty { id: migration.id });
        }
        tx.commit().await?;

        info!(
            migration.id = migration.id,
            batches = schedule.batches,
            final_delay = ?schedule.final_delay,
            "Scheduled batched migration"
        );

        Ok(QueueOutcome::Scheduled {
            id: migration.id,
            batches: schedule.batches,
            final_delay: schedule.final_delay,
        })
    }

    /// Key range to migrate, clamped to the rows that exist.
    async fn bounds(&self, pool: &PgPool) -> Result<Option<BatchRange>> {
        let mut conn = pool.acquire().await?;
        let bounds = batching::table_bounds(
            &mut conn,
            &self.identity.table_name,
            &self.identity.column_names,
            self.batch_min_value.as_ref(),
        )
        .await?;

        Ok(bounds.and_then(|bounds| match &self.batch_max_value {
            Some(max) if *max < bounds.min => None,
            Some(max) if *max < bounds.max => Some(BatchRange {
                min: bounds.min,
                max: max.clone(),
            }),
            _ => Some(bounds),
        }))
    }
}

/// The migration registered under `identity`.
pub async fn find(pool: &PgPool, identity: &MigrationIdentity) -> Result<Option<BatchedMigration>> {
    Ok(storage::find_migration(pool, identity).await?)
}

/// Whether a migration is registered under `identity`, whatever its status.
pub async fn is_scheduled(pool: &PgPool, identity: &MigrationIdentity) -> Result<bool> {
    Ok(find(pool, identity).await?.is_some())
}

/// Status of the migration registered under `identity`.
pub async fn status(pool: &PgPool, identity: &MigrationIdentity) -> Result<Option<MigrationStatus>> {
    Ok(find(pool, identity).await?.map(|migration| migration.status))
}

/// Batch counts of the migration registered under `identity`.
pub async fn progress(pool: &PgPool, identity: &MigrationIdentity) -> Result<Option<Progress>> {
    match find(pool, identity).await? {
        Some(migration) => Ok(Some(storage::progress(pool, migration.id).await?)),
        None => Ok(None),
    }
}

/// Batch counts of migration `id`.
pub async fn progress_by_id(pool: &PgPool, id: i64) -> Result<Progress> {
    match storage::progress(pool, id).await {
        Err(sqlx::Error::RowNotFound) => Err(Error::MigrationNotFound(id)),
        result => Ok(result?),
    }
}

/// Migration `id`.
pub async fn find_by_id(pool: &PgPool, id: i64) -> Result<BatchedMigration> {
    storage::find_migration_by_id(pool, id)
        .await?
        .ok_or(Error::MigrationNotFound(id))
}

/// All migrations, or those in `status`.
pub async fn list(pool: &PgPool, status: Option<MigrationStatus>) -> Result<Vec<BatchedMigration>> {
    Ok(storage::list_migrations(pool, status).await?)
}

/// Stop workers from picking up batches of migration `id`.
///
/// Batches already running complete.
#[instrument(name = "batched_migrations.pause", skip(pool))]
pub async fn pause(pool: &PgPool, id: i64) -> Result<BatchedMigration> {
    let mut tx = pool.begin().await?;
    let migration = change_status(&mut tx, id, MigrationStatus::Paused, MigrationStatus::Paused).await?;
    tx.commit().await?;
    info!("Paused batched migration");
    Ok(migration)
}

/// Let workers pick up batches of the paused migration `id` again.
#[instrument(name = "batched_migrations.resume", skip(pool))]
pub async fn resume(pool: &PgPool, id: i64) -> Result<BatchedMigration> {
    let mut tx = pool.begin().await?;
    let mut migration = change_status(&mut tx, id, MigrationStatus::Paused, MigrationStatus::Active).await?;
    if storage::finish_if_complete_tx(&mut tx, id).await? {
        migration = storage::find_migration_by_id(&mut *tx, id)
            .await?
            .ok_or(Error::MigrationNotFound(id))?;
    }
    tx.commit().await?;
    info!(status = %migration.status, "Resumed batched migration");
    Ok(migration)
}

/// Reactivate the failed migration `id` and give its failed batches a fresh attempt budget.
#[instrument(name = "batched_migrations.retry_failed", skip(pool))]
pub async fn retry_failed(pool: &PgPool, id: i64) -> Result<BatchedMigration> {
    let mut tx = pool.begin().await?;
    let migration = change_status(&mut tx, id, MigrationStatus::Failed, MigrationStatus::Active).await?;
    let reset = storage::reset_failed_jobs_tx(&mut tx, id).await?;
    tx.commit().await?;
    info!(batches = reset, "Retrying failed batches");
    Ok(migration)
}

async fn change_status(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    id: i64,
    from: MigrationStatus,
    to: MigrationStatus,
) -> Result<BatchedMigration> {
    let current = storage::lock_migration_for_update_tx(tx, id)
        .await?
        .ok_or(Error::MigrationNotFound(id))?;

    // Pausing a paused migration is a no-op
    if current.status == to && from == to {
        return Ok(current);
    }
    let allowed = if from == to {
        current.status.can_transition_to(to)
    } else {
        current.status == from
    };
    if !allowed {
        return Err(Error::InvalidTransition {
            id,
            from: current.status,
            to,
        });
    }

    storage::transition(&mut **tx, id, to)
        .await?
        .ok_or(Error::InvalidTransition {
            id,
            from: current.status,
            to,
        })
}

/// Remove the migration registered under `identity` with all its batches.
///
/// Batches already running complete first; no other batch runs afterwards.
/// Rows already transformed stay transformed. Returns whether a record was removed.
#[instrument(name = "batched_migrations.delete", skip_all, fields(migration.identity = %identity))]
pub async fn delete_migration(pool: &PgPool, identity: &MigrationIdentity) -> Result<bool> {
    let deleted = storage::delete_migration(pool, identity).await?;
    if deleted {
        info!("Deleted batched migration");
    } else {
        warn!("No batched migration to delete");
    }
    Ok(deleted)
}

/// Remove the batch tracking rows of the migration registered under
/// `identity` whose status is one of `statuses`.
///
/// The migration record stays, so its status can still be checked.
/// Returns the number of removed batches.
#[instrument(name = "batched_migrations.delete_job_tracking", skip_all, fields(migration.identity = %identity))]
pub async fn delete_job_tracking(
    pool: &PgPool,
    identity: &MigrationIdentity,
    statuses: &[JobStatus],
) -> Result<u64> {
    let Some(migration) = storage::find_migration(pool, identity).await? else {
        info!("No batched migration to delete batches of");
        return Ok(0);
    };
    let deleted = storage::delete_jobs_with_status(pool, migration.id, statuses).await?;
    info!(migration.id = migration.id, batches = deleted, ?statuses, "Deleted batch tracking");
    Ok(deleted)
}

/// Rewrite job arguments stored in the legacy flat shape into nested arrays.
///
/// Returns the number of rewritten records.
#[instrument(name = "batched_migrations.normalize_legacy_job_arguments", skip_all)]
pub async fn normalize_legacy_job_arguments(pool: &PgPool) -> Result<u64> {
    let rewritten = storage::normalize_legacy_job_arguments(pool).await?;
    info!(rewritten, "Normalized legacy job arguments");
    Ok(rewritten)
}

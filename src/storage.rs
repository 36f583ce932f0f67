use crate::arguments::JobArguments;
use crate::cursor::BatchRange;
use crate::schema::{
    BatchedJob, BatchedMigration, JOB_COLUMNS, MIGRATION_COLUMNS, MigrationIdentity, Progress,
};
use crate::status::{JobStatus, MigrationStatus};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{PgConnection, PgExecutor, PgPool, Postgres, Transaction};
use std::time::Duration;
use tracing::warn;

/// Creates or upgrades the tables used to track batched migrations.
pub async fn setup_database(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// Values of a migration about to be inserted.
#[derive(Debug)]
pub(crate) struct NewMigration<'a> {
    pub(crate) identity: &'a MigrationIdentity,
    pub(crate) bounds: &'a BatchRange,
    pub(crate) batch_size: i32,
    pub(crate) sub_batch_size: i32,
    pub(crate) max_batch_size: Option<i32>,
    pub(crate) interval_seconds: i32,
    pub(crate) pause_ms: i32,
    pub(crate) status: MigrationStatus,
    pub(crate) gitlab_schema: &'a str,
    pub(crate) total_tuple_count: Option<i64>,
    pub(crate) created_at: DateTime<Utc>,
}

/// Inserts a migration, unless one with the same identity exists.
pub(crate) async fn insert_migration(
    conn: &mut PgConnection,
    migration: &NewMigration<'_>,
) -> Result<Option<BatchedMigration>, sqlx::Error> {
    let identity = migration.identity;
    sqlx::query_as::<_, BatchedMigration>(&format!(
        r"
        INSERT INTO batched_background_migrations (
            job_class_name, table_name, column_names, job_arguments, min_cursor, max_cursor,
            batch_size, sub_batch_size, max_batch_size, interval_seconds, pause_ms, status,
            gitlab_schema, total_tuple_count, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $15)
        ON CONFLICT (job_class_name, table_name, column_names, job_arguments) DO NOTHING
        RETURNING {MIGRATION_COLUMNS}
        "
    ))
    .bind(&identity.job_class_name)
    .bind(&identity.table_name)
    .bind(&identity.column_names)
    .bind(Json(identity.job_arguments.to_value()))
    .bind(migration.bounds.min.values())
    .bind(migration.bounds.max.values())
    .bind(migration.batch_size)
    .bind(migration.sub_batch_size)
    .bind(migration.max_batch_size)
    .bind(migration.interval_seconds)
    .bind(migration.pause_ms)
    .bind(migration.status)
    .bind(migration.gitlab_schema)
    .bind(migration.total_tuple_count)
    .bind(migration.created_at)
    .fetch_optional(conn)
    .await
}

/// Finds the migration registered under `identity`.
pub(crate) async fn find_migration<'e>(
    executor: impl PgExecutor<'e>,
    identity: &MigrationIdentity,
) -> Result<Option<BatchedMigration>, sqlx::Error> {
    sqlx::query_as::<_, BatchedMigration>(&format!(
        r"
        SELECT {MIGRATION_COLUMNS}
        FROM batched_background_migrations
        WHERE job_class_name = $1
          AND table_name = $2
          AND column_names = $3
          AND job_arguments = $4
        "
    ))
    .bind(&identity.job_class_name)
    .bind(&identity.table_name)
    .bind(&identity.column_names)
    .bind(Json(identity.job_arguments.to_value()))
    .fetch_optional(executor)
    .await
}

pub(crate) async fn find_migration_by_id<'e>(
    executor: impl PgExecutor<'e>,
    id: i64,
) -> Result<Option<BatchedMigration>, sqlx::Error> {
    sqlx::query_as::<_, BatchedMigration>(&format!(
        "SELECT {MIGRATION_COLUMNS} FROM batched_background_migrations WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(executor)
    .await
}

/// Locks a migration row for a status change.
pub(crate) async fn lock_migration_for_update_tx(
    tx: &mut Transaction<'_, Postgres>,
    id: i64,
) -> Result<Option<BatchedMigration>, sqlx::Error> {
    sqlx::query_as::<_, BatchedMigration>(&format!(
        "SELECT {MIGRATION_COLUMNS} FROM batched_background_migrations WHERE id = $1 FOR UPDATE"
    ))
    .bind(id)
    .fetch_optional(&mut **tx)
    .await
}

/// Lists migrations, optionally restricted to one status.
pub(crate) async fn list_migrations(
    pool: &PgPool,
    status: Option<MigrationStatus>,
) -> Result<Vec<BatchedMigration>, sqlx::Error> {
    sqlx::query_as::<_, BatchedMigration>(&format!(
        r"
        SELECT {MIGRATION_COLUMNS}
        FROM batched_background_migrations
        WHERE $1::smallint IS NULL OR status = $1
        ORDER BY id
        "
    ))
    .bind(status.map(MigrationStatus::as_i16))
    .fetch_all(pool)
    .await
}

/// Moves a migration to `to` if its current status allows it.
///
/// Returns `None` when the migration is missing or its status changed
/// concurrently to one that cannot reach `to`.
pub(crate) async fn transition<'e>(
    executor: impl PgExecutor<'e>,
    id: i64,
    to: MigrationStatus,
) -> Result<Option<BatchedMigration>, sqlx::Error> {
    transition_from(executor, id, &MigrationStatus::sources_of(to), to).await
}

/// Moves a migration to `to` only if it currently is in one of `from`.
pub(crate) async fn transition_from<'e>(
    executor: impl PgExecutor<'e>,
    id: i64,
    from: &[MigrationStatus],
    to: MigrationStatus,
) -> Result<Option<BatchedMigration>, sqlx::Error> {
    let sources = from
        .iter()
        .copied()
        .filter(|source| source.can_transition_to(to))
        .map(MigrationStatus::as_i16)
        .collect::<Vec<_>>();

    sqlx::query_as::<_, BatchedMigration>(&format!(
        r"
        UPDATE batched_background_migrations
        SET status = $2,
            updated_at = NOW(),
            finished_at = CASE WHEN $2 IN (3, 6) THEN NOW() ELSE finished_at END
        WHERE id = $1 AND status = ANY($3)
        RETURNING {MIGRATION_COLUMNS}
        "
    ))
    .bind(id)
    .bind(to)
    .bind(sources)
    .fetch_optional(executor)
    .await
}

/// Deletes a migration and its batches.
///
/// Batch rows are locked in the same order as workers lock them: batches
/// first, then the migration. Batches that are not running go first, so no
/// worker can claim them while a running batch is waited for.
pub(crate) async fn delete_migration(
    pool: &PgPool,
    identity: &MigrationIdentity,
) -> Result<bool, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let Some(id) = sqlx::query_scalar::<_, i64>(
        r"
        SELECT id
        FROM batched_background_migrations
        WHERE job_class_name = $1
          AND table_name = $2
          AND column_names = $3
          AND job_arguments = $4
        ",
    )
    .bind(&identity.job_class_name)
    .bind(&identity.table_name)
    .bind(&identity.column_names)
    .bind(Json(identity.job_arguments.to_value()))
    .fetch_optional(&mut *tx)
    .await?
    else {
        tx.rollback().await?;
        return Ok(false);
    };

    sqlx::query(
        r"
        DELETE FROM batched_background_migration_jobs
        WHERE id IN (
            SELECT id
            FROM batched_background_migration_jobs
            WHERE batched_background_migration_id = $1
            FOR UPDATE SKIP LOCKED
        )
        ",
    )
    .bind(id)
    .execute(&mut *tx)
    .await?;

    // Waits for batches that are still running
    sqlx::query("DELETE FROM batched_background_migration_jobs WHERE batched_background_migration_id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    let result = sqlx::query("DELETE FROM batched_background_migrations WHERE id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    Ok(result.rows_affected() > 0)
}

/// Deletes the batches of a migration whose status is one of `statuses`.
///
/// Running batches matching `statuses` are waited for.
pub(crate) async fn delete_jobs_with_status(
    pool: &PgPool,
    migration_id: i64,
    statuses: &[JobStatus],
) -> Result<u64, sqlx::Error> {
    let statuses = statuses.iter().copied().map(JobStatus::as_i16).collect::<Vec<_>>();
    let result = sqlx::query(
        r"
        DELETE FROM batched_background_migration_jobs
        WHERE batched_background_migration_id = $1 AND status = ANY($2)
        ",
    )
    .bind(migration_id)
    .bind(statuses)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Values of a batch about to be queued.
#[derive(Debug, Clone)]
pub(crate) struct NewJob<'a> {
    pub(crate) migration_id: i64,
    pub(crate) range: &'a BatchRange,
    pub(crate) batch_size: i32,
    pub(crate) sub_batch_size: i32,
    pub(crate) run_at: DateTime<Utc>,
}

pub(crate) async fn insert_job(
    conn: &mut PgConnection,
    job: &NewJob<'_>,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        r"
        INSERT INTO batched_background_migration_jobs (
            batched_background_migration_id, min_value, max_value, batch_size, sub_batch_size, run_at
        )
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING id
        ",
    )
    .bind(job.migration_id)
    .bind(job.range.min.values())
    .bind(job.range.max.values())
    .bind(job.batch_size)
    .bind(job.sub_batch_size)
    .bind(job.run_at)
    .fetch_one(conn)
    .await
}

/// Finds the next due batch of an active migration and locks it.
///
/// Batches are only considered when their migration belongs to
/// `gitlab_schema` and its job class is one the caller can run.
pub(crate) async fn find_next_due_job_tx(
    tx: &mut Transaction<'_, Postgres>,
    job_class_names: &[String],
    gitlab_schema: &str,
    max_attempts: i32,
) -> Result<Option<BatchedJob>, sqlx::Error> {
    sqlx::query_as::<_, BatchedJob>(
        r"
        SELECT j.*
        FROM batched_background_migration_jobs j
        JOIN batched_background_migrations m ON m.id = j.batched_background_migration_id
        WHERE m.status = 1
          AND m.gitlab_schema = $1
          AND m.job_class_name = ANY($2)
          AND j.status <> 3
          AND j.attempts < $3
          AND j.run_at <= NOW()
        ORDER BY j.run_at, j.id
        LIMIT 1
        FOR UPDATE OF j SKIP LOCKED
        ",
    )
    .bind(gitlab_schema)
    .bind(job_class_names)
    .bind(max_attempts)
    .fetch_optional(&mut **tx)
    .await
}

/// Moves active migrations with an exhausted failed batch to `failed`.
///
/// Returns the ids of the migrations that failed.
pub(crate) async fn fail_exhausted_migrations(
    pool: &PgPool,
    job_class_names: &[String],
    gitlab_schema: &str,
    max_attempts: i32,
) -> Result<Vec<i64>, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        r"
        UPDATE batched_background_migrations m
        SET status = $1, updated_at = NOW()
        WHERE m.status = $2
          AND m.gitlab_schema = $3
          AND m.job_class_name = ANY($4)
          AND EXISTS (
              SELECT 1
              FROM batched_background_migration_jobs j
              WHERE j.batched_background_migration_id = m.id
                AND j.status = $5
                AND j.attempts >= $6
          )
        RETURNING m.id
        ",
    )
    .bind(MigrationStatus::Failed)
    .bind(MigrationStatus::Active)
    .bind(gitlab_schema)
    .bind(job_class_names)
    .bind(JobStatus::Failed)
    .bind(max_attempts)
    .fetch_all(pool)
    .await
}

/// Locks the next unfinished batch of a migration, waiting for batches
/// that a worker is still running.
pub(crate) async fn lock_next_unfinished_job_tx(
    tx: &mut Transaction<'_, Postgres>,
    migration_id: i64,
) -> Result<Option<BatchedJob>, sqlx::Error> {
    sqlx::query_as::<_, BatchedJob>(&format!(
        r"
        SELECT {JOB_COLUMNS}
        FROM batched_background_migration_jobs
        WHERE batched_background_migration_id = $1 AND status <> 3
        ORDER BY min_value, id
        LIMIT 1
        FOR UPDATE
        "
    ))
    .bind(migration_id)
    .fetch_optional(&mut **tx)
    .await
}

pub(crate) async fn unfinished_job_count(
    pool: &PgPool,
    migration_id: i64,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        r"
        SELECT COUNT(*)
        FROM batched_background_migration_jobs
        WHERE batched_background_migration_id = $1 AND status <> 3
        ",
    )
    .bind(migration_id)
    .fetch_one(pool)
    .await
}

/// Locks the migration row so that outcome bookkeeping of concurrent
/// batches is serialized.
pub(crate) async fn lock_migration_tx(
    tx: &mut Transaction<'_, Postgres>,
    migration_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        UPDATE batched_background_migrations
        SET started_at = COALESCE(started_at, NOW())
        WHERE id = $1
        ",
    )
    .bind(migration_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Marks a batch as successfully run.
pub(crate) async fn mark_job_succeeded_tx(
    tx: &mut Transaction<'_, Postgres>,
    job_id: i64,
    started_at: DateTime<Utc>,
    sub_batch_size: i32,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        UPDATE batched_background_migration_jobs
        SET status = $2,
            attempts = attempts + 1,
            sub_batch_size = $3,
            started_at = $4,
            finished_at = NOW(),
            last_error = NULL
        WHERE id = $1
        ",
    )
    .bind(job_id)
    .bind(JobStatus::Succeeded)
    .bind(sub_batch_size)
    .bind(started_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Marks that we just tried and failed to run a batch.
///
/// The next attempt is pushed back by `retry_backoff * 2^(attempts - 1)`
/// and will use `next_sub_batch_size`. Returns the number of attempts made.
pub(crate) async fn mark_job_failed_tx(
    tx: &mut Transaction<'_, Postgres>,
    job_id: i64,
    started_at: DateTime<Utc>,
    next_sub_batch_size: i32,
    error: &str,
    retry_backoff: Duration,
) -> Result<i32, sqlx::Error> {
    let backoff_ms = i64::try_from(retry_backoff.as_millis()).unwrap_or(i64::MAX);

    sqlx::query_scalar::<_, i32>(
        r"
        UPDATE batched_background_migration_jobs
        SET status = $2,
            attempts = attempts + 1,
            sub_batch_size = $3,
            started_at = $4,
            finished_at = NOW(),
            last_error = $5,
            run_at = NOW() + ($6 * POWER(2, attempts)) * INTERVAL '1 millisecond'
        WHERE id = $1
        RETURNING attempts
        ",
    )
    .bind(job_id)
    .bind(JobStatus::Failed)
    .bind(next_sub_batch_size)
    .bind(started_at)
    .bind(error)
    .bind(backoff_ms)
    .fetch_one(&mut **tx)
    .await
}

/// Moves an active migration to `finished` once none of its batches is left.
pub(crate) async fn finish_if_complete_tx(
    tx: &mut Transaction<'_, Postgres>,
    migration_id: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r"
        UPDATE batched_background_migrations
        SET status = $2, finished_at = NOW(), updated_at = NOW()
        WHERE id = $1
          AND status = $3
          AND NOT EXISTS (
              SELECT 1
              FROM batched_background_migration_jobs
              WHERE batched_background_migration_id = $1 AND status <> 3
          )
        ",
    )
    .bind(migration_id)
    .bind(MigrationStatus::Finished)
    .bind(MigrationStatus::Active)
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Marks a migration that has nothing to process as finished, whatever it started as.
pub(crate) async fn mark_finished_tx(
    tx: &mut Transaction<'_, Postgres>,
    migration_id: i64,
) -> Result<BatchedMigration, sqlx::Error> {
    sqlx::query_as::<_, BatchedMigration>(&format!(
        r"
        UPDATE batched_background_migrations
        SET status = $2, finished_at = NOW(), updated_at = NOW()
        WHERE id = $1
        RETURNING {MIGRATION_COLUMNS}
        "
    ))
    .bind(migration_id)
    .bind(MigrationStatus::Finished)
    .fetch_one(&mut **tx)
    .await
}

pub(crate) async fn update_sub_batch_size_tx(
    tx: &mut Transaction<'_, Postgres>,
    migration_id: i64,
    sub_batch_size: i32,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE batched_background_migrations SET sub_batch_size = $2, updated_at = NOW() WHERE id = $1",
    )
    .bind(migration_id)
    .bind(sub_batch_size)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Makes every failed batch of a migration due again with a fresh attempt budget.
pub(crate) async fn reset_failed_jobs_tx(
    tx: &mut Transaction<'_, Postgres>,
    migration_id: i64,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r"
        UPDATE batched_background_migration_jobs
        SET attempts = 0, run_at = NOW()
        WHERE batched_background_migration_id = $1 AND status = $2
        ",
    )
    .bind(migration_id)
    .bind(JobStatus::Failed)
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected())
}

/// Batch counts of a migration.
pub(crate) async fn progress(pool: &PgPool, migration_id: i64) -> Result<Progress, sqlx::Error> {
    sqlx::query_as::<_, Progress>(
        r"
        SELECT COUNT(j.id) AS total_batches,
               COUNT(j.id) FILTER (WHERE j.status = 3) AS succeeded_batches,
               COUNT(j.id) FILTER (WHERE j.status = 2) AS failed_batches,
               m.total_tuple_count
        FROM batched_background_migrations m
        LEFT JOIN batched_background_migration_jobs j ON j.batched_background_migration_id = m.id
        WHERE m.id = $1
        GROUP BY m.id
        ",
    )
    .bind(migration_id)
    .fetch_one(pool)
    .await
}

/// Rewrites job arguments stored in the legacy flat shape.
///
/// Returns the number of rewritten records. Records whose normalized
/// arguments collide with an existing migration are left untouched.
pub(crate) async fn normalize_legacy_job_arguments(pool: &PgPool) -> Result<u64, sqlx::Error> {
    let legacy = sqlx::query_as::<_, (i64, Json<Value>)>(
        r"
        SELECT id, job_arguments
        FROM batched_background_migrations
        WHERE CASE
            WHEN jsonb_typeof(job_arguments) = 'array' THEN EXISTS (
                SELECT 1 FROM jsonb_array_elements(job_arguments) AS element
                WHERE jsonb_typeof(element) <> 'array'
            )
            ELSE TRUE
        END
        ORDER BY id
        ",
    )
    .fetch_all(pool)
    .await?;

    let mut rewritten = 0;
    for (id, Json(arguments)) in legacy {
        let normalized = JobArguments::normalize(arguments);
        let result = sqlx::query(
            "UPDATE batched_background_migrations SET job_arguments = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(Json(normalized.to_value()))
        .execute(pool)
        .await;

        match result {
            Ok(_) => rewritten += 1,
            Err(sqlx::Error::Database(error)) if error.is_unique_violation() => {
                warn!(
                    migration.id = id,
                    "Normalized job arguments collide with another batched migration, leaving them as they are"
                );
            }
            Err(error) => return Err(error),
        }
    }

    Ok(rewritten)
}

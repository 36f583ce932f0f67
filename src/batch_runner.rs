//! Running one batch: sub-batching, throttling and outcome bookkeeping.

use crate::batched_job::SubBatch;
use crate::batching::BatchIterator;
use crate::job_registry::JobRegistry;
use crate::schema::{BatchedJob, BatchedMigration};
use crate::status::MigrationStatus;
use crate::storage;
use crate::util::{try_to_extract_panic_info, with_sentry_transaction};
use anyhow::anyhow;
use chrono::Utc;
use futures_util::FutureExt;
use sentry_core::{Hub, SentryFutureExt};
use sqlx::{PgPool, Postgres, Transaction};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{Instrument, debug, info_span, trace, warn};

/// Sub-batches grow by this factor after a fast batch.
const GROWTH_FACTOR: f64 = 1.2;

/// How attempts are bounded and spaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RetryPolicy {
    pub(crate) max_attempts: i32,
    pub(crate) retry_backoff: Duration,
}

/// Who is running the batch, which decides how the migration status moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// A background worker: finishes or fails the migration as batches complete.
    Background,
    /// The finalizer: leaves the migration status to the caller.
    Finalize,
}

/// What happened to a batch.
#[derive(Debug)]
pub(crate) enum BatchOutcome {
    Succeeded {
        migration_finished: bool,
    },
    Failed {
        error: anyhow::Error,
        attempts: i32,
        migration_failed: bool,
    },
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct BatchMetrics {
    pub(crate) sub_batches: usize,
    pub(crate) rows: i64,
}

/// Applies registered transformations to batches.
pub(crate) struct BatchRunner<Context> {
    pub(crate) connection_pool: PgPool,
    pub(crate) context: Context,
    pub(crate) job_registry: Arc<JobRegistry<Context>>,
}

impl<Context: Clone + Send + Sync + 'static> BatchRunner<Context> {
    /// Runs `job` and records its outcome in `tx`, which must hold the lock on the batch row.
    pub(crate) async fn execute(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        migration: &BatchedMigration,
        job: &BatchedJob,
        policy: RetryPolicy,
        mode: Mode,
    ) -> Result<BatchOutcome, sqlx::Error> {
        let sub_batch_size = effective_sub_batch_size(migration, job);
        let span = info_span!(
            "batch",
            migration.id = migration.id,
            migration.job_class_name = %migration.job_class_name,
            batch.id = job.id,
            batch.range = %job.range(),
            batch.attempt = job.attempts + 1,
        );

        let started_at = Utc::now();
        let clock = Instant::now();
        let result = with_sentry_transaction(&migration.job_class_name, || async {
            AssertUnwindSafe(self.run_sub_batches(migration, job, sub_batch_size))
                .catch_unwind()
                .await
                .map_err(|e| try_to_extract_panic_info(&*e))
                .and_then(std::convert::identity)
        })
        .instrument(span.clone())
        .bind_hub(Hub::current())
        .await;
        let elapsed = clock.elapsed();

        async {
            storage::lock_migration_tx(tx, migration.id).await?;

            match result {
                Ok(metrics) => {
                    debug!(
                        sub_batches = metrics.sub_batches,
                        rows = metrics.rows,
                        ?elapsed,
                        "Batch succeeded"
                    );
                    storage::mark_job_succeeded_tx(tx, job.id, started_at, sub_batch_size).await?;

                    let mut migration_finished = false;
                    if mode == Mode::Background {
                        let tuned = tune_sub_batch_size(migration, elapsed);
                        if tuned != migration.sub_batch_size {
                            trace!(from = migration.sub_batch_size, to = tuned, "Adjusting sub-batch size");
                            storage::update_sub_batch_size_tx(tx, migration.id, tuned).await?;
                        }

                        migration_finished = storage::finish_if_complete_tx(tx, migration.id).await?;
                    }

                    Ok::<_, sqlx::Error>(BatchOutcome::Succeeded { migration_finished })
                }
                Err(error) => {
                    warn!("Failed to run batch: {error:#}");
                    let attempts = storage::mark_job_failed_tx(
                        tx,
                        job.id,
                        started_at,
                        reduced_sub_batch_size(sub_batch_size),
                        &format!("{error:#}"),
                        policy.retry_backoff,
                    )
                    .await?;

                    let mut migration_failed = false;
                    if mode == Mode::Background && attempts >= policy.max_attempts {
                        migration_failed = storage::transition_from(
                            &mut **tx,
                            migration.id,
                            &[MigrationStatus::Active, MigrationStatus::Paused],
                            MigrationStatus::Failed,
                        )
                        .await?
                        .is_some();
                    }

                    Ok::<_, sqlx::Error>(BatchOutcome::Failed {
                        error,
                        attempts,
                        migration_failed,
                    })
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Carves the batch into sub-batches and transforms each in its own transaction.
    async fn run_sub_batches(
        &self,
        migration: &BatchedMigration,
        job: &BatchedJob,
        sub_batch_size: i32,
    ) -> anyhow::Result<BatchMetrics> {
        let perform = self
            .job_registry
            .get(&migration.job_class_name)
            .ok_or_else(|| anyhow!("Unknown job class {}", migration.job_class_name))?;

        let mut sub_batches = BatchIterator::new(
            migration.table_name.clone(),
            migration.column_names.clone(),
            job.range(),
            i64::from(sub_batch_size),
        );
        let arguments = &migration.job_arguments.0;
        let pause = migration.pause();
        let mut metrics = BatchMetrics::default();

        loop {
            if metrics.sub_batches > 0 && !pause.is_zero() {
                sleep(pause).await;
            }

            let mut tx = self.connection_pool.begin().await?;
            let Some(batch) = sub_batches.next_batch(&mut tx).await? else {
                tx.rollback().await?;
                break;
            };

            let sub_batch = SubBatch {
                table_name: migration.table_name.clone(),
                column_names: migration.column_names.clone(),
                range: batch.range,
                rows: batch.rows,
            };
            trace!(sub_batch.range = %sub_batch.range, "Running sub-batch…");

            perform(&self.context, &mut tx, &sub_batch, arguments).await?;
            tx.commit().await?;

            metrics.sub_batches += 1;
            metrics.rows += sub_batch.rows;
        }

        Ok(metrics)
    }
}

/// Sub-batch size for the next attempt of `job`.
///
/// First attempts follow the migration; retries keep the reduced size
/// recorded on the batch.
pub(crate) fn effective_sub_batch_size(migration: &BatchedMigration, job: &BatchedJob) -> i32 {
    let size = if job.attempts == 0 {
        migration.sub_batch_size
    } else {
        job.sub_batch_size
    };
    size.clamp(1, job.batch_size.max(1))
}

/// Halves the sub-batch size after a failure, never going below one row.
pub(crate) fn reduced_sub_batch_size(sub_batch_size: i32) -> i32 {
    (sub_batch_size / 2).max(1)
}

/// Grows the sub-batch size when a batch used less than half its interval.
///
/// Growth stops at the batch size, or at `max_batch_size` when that is lower.
pub(crate) fn tune_sub_batch_size(migration: &BatchedMigration, elapsed: Duration) -> i32 {
    let current = migration.sub_batch_size;
    let ceiling = migration
        .max_batch_size
        .map_or(migration.batch_size, |max| max.min(migration.batch_size));

    if current >= ceiling || elapsed >= migration.interval() / 2 {
        return current;
    }

    #[allow(clippy::cast_possible_truncation)]
    let grown = (f64::from(current) * GROWTH_FACTOR).ceil() as i32;
    grown.max(current + 1).min(ceiling)
}

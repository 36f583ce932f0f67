//! Draining migrations synchronously at deploy time.

use crate::batch_runner::{BatchOutcome, BatchRunner, Mode, RetryPolicy};
use crate::batching;
use crate::errors::{Error, Result};
use crate::schema::{BatchedMigration, MigrationIdentity};
use crate::status::{JobStatus, MigrationStatus};
use crate::storage;
use serde::Serialize;
use sqlx::PgPool;
use tracing::{debug, info, instrument, warn};

/// What finalizing a migration did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FinalizeOutcome {
    /// No migration is registered under the identity.
    NotFound,
    /// The migration had already completed, with the given status.
    AlreadyFinished {
        /// `finished` or `finalized`
        status: MigrationStatus,
    },
    /// The remaining batches were run and the migration is now `finalized`.
    Finalized {
        /// Number of batches run by the finalizer
        batches: usize,
    },
}

/// Runs the outstanding batches of migrations in the calling task.
///
/// Obtained from [`Runner::finalizer`](crate::Runner::finalizer), so it
/// knows the same transformations as the background workers.
pub struct Finalizer<Context> {
    pub(crate) batch_runner: BatchRunner<Context>,
    pub(crate) retry_policy: RetryPolicy,
    pub(crate) delete_tracking: Vec<JobStatus>,
}

impl<Context: Clone + Send + Sync + 'static> Finalizer<Context> {
    fn pool(&self) -> &PgPool {
        &self.batch_runner.connection_pool
    }

    /// Delete the batches in one of `statuses` once a migration is finalized.
    ///
    /// The migration record is kept.
    pub fn delete_tracking_jobs(mut self, statuses: impl IntoIterator<Item = JobStatus>) -> Self {
        self.delete_tracking = statuses.into_iter().collect();
        self
    }

    /// Run every batch of the migration that has not succeeded yet, then mark it `finalized`.
    ///
    /// Pending and failed batches run regardless of their due time or
    /// remaining attempts. Batches currently held by a worker are waited
    /// for. If a batch fails, the migration becomes `failed` and the
    /// transformation error is returned.
    #[instrument(name = "batched_migrations.finalize", skip_all, fields(migration.identity = %identity))]
    pub async fn finalize(&self, identity: &MigrationIdentity) -> Result<FinalizeOutcome> {
        let Some(migration) = storage::find_migration(self.pool(), identity).await? else {
            log_not_found(identity);
            return Ok(FinalizeOutcome::NotFound);
        };
        if migration.status.is_complete() {
            log_already_finished(&migration);
            return Ok(FinalizeOutcome::AlreadyFinished {
                status: migration.status,
            });
        }
        if self.batch_runner.job_registry.get(&migration.job_class_name).is_none() {
            return Err(Error::UnknownJobClass(migration.job_class_name));
        }

        let migration = match self.start_finalizing(&migration).await? {
            Ok(migration) => migration,
            Err(status) => return Ok(FinalizeOutcome::AlreadyFinished { status }),
        };
        info!(migration.id = migration.id, "Finalizing batched migration…");

        let batches = self.drain(identity, &migration).await?;

        storage::transition(self.pool(), migration.id, MigrationStatus::Finalized)
            .await?
            .ok_or_else(|| Error::InvalidTransition {
                id: migration.id,
                from: MigrationStatus::Finalizing,
                to: MigrationStatus::Finalized,
            })?;
        info!(migration.id = migration.id, batches, "Finalized batched migration");

        if !self.delete_tracking.is_empty() {
            let deleted =
                storage::delete_jobs_with_status(self.pool(), migration.id, &self.delete_tracking).await?;
            debug!(migration.id = migration.id, deleted, "Deleted batch tracking");
        }

        Ok(FinalizeOutcome::Finalized { batches })
    }

    /// Move the migration to `finalizing`, or pick up an interrupted finalization.
    ///
    /// `Err(status)` means the migration completed concurrently.
    async fn start_finalizing(
        &self,
        migration: &BatchedMigration,
    ) -> Result<std::result::Result<BatchedMigration, MigrationStatus>> {
        if migration.status == MigrationStatus::Finalizing {
            return Ok(Ok(migration.clone()));
        }
        if let Some(updated) =
            storage::transition(self.pool(), migration.id, MigrationStatus::Finalizing).await?
        {
            return Ok(Ok(updated));
        }

        let current = storage::find_migration_by_id(self.pool(), migration.id)
            .await?
            .ok_or(Error::MigrationNotFound(migration.id))?;
        match current.status {
            MigrationStatus::Finalizing => Ok(Ok(current)),
            status if status.is_complete() => Ok(Err(status)),
            from => Err(Error::InvalidTransition {
                id: migration.id,
                from,
                to: MigrationStatus::Finalizing,
            }),
        }
    }

    async fn drain(&self, identity: &MigrationIdentity, migration: &BatchedMigration) -> Result<usize> {
        let mut batches = 0;
        loop {
            let mut tx = self.pool().begin().await?;
            let Some(job) = storage::lock_next_unfinished_job_tx(&mut tx, migration.id).await? else {
                tx.rollback().await?;
                // A batch finished by a worker while we waited for its lock
                // hides the ones after it from this round
                if storage::unfinished_job_count(self.pool(), migration.id).await? == 0 {
                    return Ok(batches);
                }
                continue;
            };

            debug!(batch.id = job.id, batch.range = %job.range(), "Running remaining batch…");
            let outcome = self
                .batch_runner
                .execute(&mut tx, migration, &job, self.retry_policy, Mode::Finalize)
                .await?;
            tx.commit().await?;

            match outcome {
                BatchOutcome::Succeeded { .. } => batches += 1,
                BatchOutcome::Failed { error, .. } => {
                    storage::transition(self.pool(), migration.id, MigrationStatus::Failed).await?;
                    return Err(Error::FinalizeFailed {
                        identity: identity.clone(),
                        source: error,
                    });
                }
            }
        }
    }

    /// Make sure the migration completed, finalizing it when `finalize` is set.
    ///
    /// A migration that was never registered is not an error: later
    /// migrations run this check without knowing whether the earlier
    /// registration happened in this database.
    pub async fn ensure_finished(
        &self,
        identity: &MigrationIdentity,
        finalize: bool,
    ) -> Result<FinalizeOutcome> {
        if !finalize {
            return ensure_finished(self.pool(), identity).await;
        }
        self.finalize(identity).await
    }

    /// Finalize the migration once per physical table in `tables`.
    ///
    /// Tables that do not exist are skipped without looking up a migration.
    pub async fn finalize_partitions<I, S>(
        &self,
        identity: &MigrationIdentity,
        tables: I,
    ) -> Result<Vec<(String, FinalizeOutcome)>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut outcomes = Vec::new();
        for table in tables {
            let table = table.as_ref();
            if !batching::table_exists(self.pool(), table).await? {
                info!(table, "Partition does not exist, not finalizing it");
                continue;
            }
            let outcome = self.finalize(&identity.for_table(table)).await?;
            outcomes.push((table.to_string(), outcome));
        }
        Ok(outcomes)
    }
}

/// Check that the migration completed without running anything.
///
/// Returns [`Error::NotFinished`] when it exists and has not completed.
pub async fn ensure_finished(pool: &PgPool, identity: &MigrationIdentity) -> Result<FinalizeOutcome> {
    let Some(migration) = storage::find_migration(pool, identity).await? else {
        log_not_found(identity);
        return Ok(FinalizeOutcome::NotFound);
    };
    if migration.status.is_complete() {
        log_already_finished(&migration);
        return Ok(FinalizeOutcome::AlreadyFinished {
            status: migration.status,
        });
    }
    Err(Error::NotFinished {
        identity: identity.clone(),
        status: migration.status,
    })
}

/// Physical tables of the partitioned table `parent`, sorted by name.
pub async fn partitions_of(pool: &PgPool, parent: &str) -> Result<Vec<String>> {
    Ok(sqlx::query_scalar::<_, String>(
        r"
        SELECT c.relname::text
        FROM pg_inherits i
        JOIN pg_class c ON c.oid = i.inhrelid
        WHERE i.inhparent = to_regclass($1)
        ORDER BY c.relname
        ",
    )
    .bind(crate::cursor::quote_ident(parent))
    .fetch_all(pool)
    .await?)
}

// Migration records are never deleted, only their batches, so a missing one
// was never registered here.
fn log_not_found(identity: &MigrationIdentity) {
    warn!(
        migration.lookup = "never_scheduled",
        "Could not find batched background migration for the given configuration: {identity}"
    );
}

fn log_already_finished(migration: &BatchedMigration) {
    info!(
        migration.id = migration.id,
        migration.lookup = "already_complete",
        status = %migration.status,
        "Batched background migration has already completed"
    );
}

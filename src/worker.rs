use crate::batch_runner::{BatchOutcome, BatchRunner, Mode, RetryPolicy};
use crate::storage;
use anyhow::anyhow;
use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

pub(crate) struct Worker<Context> {
    pub(crate) batch_runner: BatchRunner<Context>,
    pub(crate) gitlab_schema: String,
    pub(crate) retry_policy: RetryPolicy,
    pub(crate) shutdown_when_queue_empty: bool,
    pub(crate) poll_interval: Duration,
    pub(crate) jitter: Duration,
}

impl<Context: Clone + Send + Sync + 'static> Worker<Context> {
    /// Calculate the sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }

        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }

    /// Run due batches forever, or until none is due if `shutdown_when_queue_empty` is set.
    #[allow(clippy::cognitive_complexity)]
    pub(crate) async fn run(&self) {
        loop {
            match self.run_next_batch().await {
                Ok(Some(_)) => {}
                Ok(None) if self.shutdown_when_queue_empty => {
                    debug!("No due batches found. Shutting down the worker…");
                    break;
                }
                Ok(None) => {
                    let sleep_duration = self.sleep_duration_with_jitter();
                    trace!("No due batches found. Polling again in {sleep_duration:?}…");
                    sleep(sleep_duration).await;
                }
                Err(error) => {
                    error!("Failed to run batch: {error:#}");
                    sleep(self.sleep_duration_with_jitter()).await;
                }
            }
        }
    }

    /// Run the next due batch, if there is one.
    ///
    /// Returns:
    /// - `Ok(Some(batch_id))` if a batch was run, successfully or not
    /// - `Ok(None)` if no batch was due
    /// - `Err(...)` if the batch could not be claimed or its outcome not recorded
    pub(crate) async fn run_next_batch(&self) -> anyhow::Result<Option<i64>> {
        let job_class_names = self.batch_runner.job_registry.job_class_names();
        let pool = &self.batch_runner.connection_pool;

        trace!("Looking for the next due batch…");

        // The batch row stays locked until its outcome is committed
        let mut tx = pool.begin().await?;

        let job = storage::find_next_due_job_tx(
            &mut tx,
            &job_class_names,
            &self.gitlab_schema,
            self.retry_policy.max_attempts,
        )
        .await?;
        let Some(job) = job else {
            tx.rollback().await?;
            self.fail_exhausted_migrations(&job_class_names).await?;
            return Ok(None);
        };

        let migration = storage::find_migration_by_id(&mut *tx, job.batched_background_migration_id)
            .await?
            .ok_or_else(|| anyhow!("Batch {} has no batched migration", job.id))?;

        debug!(migration.id = migration.id, batch.id = job.id, "Running batch…");

        let outcome = self
            .batch_runner
            .execute(&mut tx, &migration, &job, self.retry_policy, Mode::Background)
            .await?;
        tx.commit().await?;

        match outcome {
            BatchOutcome::Succeeded {
                migration_finished: true,
            } => info!(migration.id = migration.id, "Batched migration finished"),
            BatchOutcome::Failed {
                attempts,
                migration_failed: true,
                ..
            } => warn!(
                migration.id = migration.id,
                batch.id = job.id,
                attempts,
                "Batch ran out of attempts, batched migration failed"
            ),
            BatchOutcome::Failed { attempts, .. } => {
                trace!(batch.id = job.id, attempts, "Batch will be retried if attempts remain");
            }
            BatchOutcome::Succeeded { .. } => {}
        }

        Ok(Some(job.id))
    }

    /// Fail active migrations holding a batch that has no attempts left.
    ///
    /// Such batches are never claimed again, e.g. when their last attempt
    /// failed while the migration was paused and it was resumed afterwards.
    async fn fail_exhausted_migrations(&self, job_class_names: &[String]) -> anyhow::Result<()> {
        let failed = storage::fail_exhausted_migrations(
            &self.batch_runner.connection_pool,
            job_class_names,
            &self.gitlab_schema,
            self.retry_policy.max_attempts,
        )
        .await?;

        for id in failed {
            warn!(migration.id = id, "Batched migration has a batch without attempts left, marking it failed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_registry::JobRegistry;
    use sqlx::postgres::PgPoolOptions;
    use std::sync::Arc;

    fn worker(poll_interval: Duration, jitter: Duration) -> Worker<()> {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .unwrap();
        Worker {
            batch_runner: BatchRunner {
                connection_pool: pool,
                context: (),
                job_registry: Arc::new(JobRegistry::default()),
            },
            gitlab_schema: "gitlab_main".into(),
            retry_policy: RetryPolicy {
                max_attempts: 3,
                retry_backoff: Duration::ZERO,
            },
            shutdown_when_queue_empty: true,
            poll_interval,
            jitter,
        }
    }

    #[tokio::test]
    async fn sleep_without_jitter_is_the_poll_interval() {
        let worker = worker(Duration::from_secs(1), Duration::ZERO);
        assert_eq!(worker.sleep_duration_with_jitter(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn jitter_is_bounded() {
        let worker = worker(Duration::from_secs(1), Duration::from_millis(100));
        for _ in 0..50 {
            let duration = worker.sleep_duration_with_jitter();
            assert!(duration >= Duration::from_secs(1));
            assert!(duration <= Duration::from_millis(1100));
        }
    }
}

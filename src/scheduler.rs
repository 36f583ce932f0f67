//! Turning a registered migration into a sequence of delayed batches.

use crate::batching::BatchIterator;
use crate::cursor::BatchRange;
use crate::errors::{Error, Result};
use crate::schema::BatchedMigration;
use crate::storage::{self, NewJob};
use chrono::{DateTime, TimeDelta, Utc};
use sqlx::{PgConnection, Postgres, Transaction};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, instrument};

/// A batch waiting to be dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayedBatch {
    /// Owning migration
    pub migration_id: i64,
    /// Keys covered by the batch
    pub range: BatchRange,
    /// Rows in the batch
    pub batch_size: i32,
    /// Sub-batch size for the first attempt
    pub sub_batch_size: i32,
}

/// Destination of scheduled batches.
///
/// A batch must not be handed to a worker before its `not_before` time.
pub trait DelayedQueue {
    /// Queue `batch` for dispatch at or after `not_before`.
    fn enqueue(
        &mut self,
        batch: DelayedBatch,
        not_before: DateTime<Utc>,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Queue backed by the `batched_background_migration_jobs` table.
///
/// Rows are written inside the wrapped transaction, so a registration and
/// its batches become visible together.
#[derive(Debug)]
pub struct PostgresQueue<'t> {
    tx: &'t mut Transaction<'static, Postgres>,
}

impl<'t> PostgresQueue<'t> {
    /// Wrap an open transaction.
    pub fn new(tx: &'t mut Transaction<'static, Postgres>) -> Self {
        Self { tx }
    }
}

impl DelayedQueue for PostgresQueue<'_> {
    async fn enqueue(&mut self, batch: DelayedBatch, not_before: DateTime<Utc>) -> Result<()> {
        let job = NewJob {
            migration_id: batch.migration_id,
            range: &batch.range,
            batch_size: batch.batch_size,
            sub_batch_size: batch.sub_batch_size,
            run_at: not_before,
        };
        storage::insert_job(&mut **self.tx, &job).await?;
        Ok(())
    }
}

/// A batch and the moment it becomes due.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedBatch {
    /// The batch to queue
    pub batch: DelayedBatch,
    /// Earliest dispatch time
    pub not_before: DateTime<Utc>,
    /// Delay after the scheduling moment
    pub delay: Duration,
}

/// Summary of a scheduling pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    /// Number of batches queued
    pub batches: usize,
    /// Delay of the last batch after the scheduling moment, zero when nothing was queued
    pub final_delay: Duration,
}

/// Computes every batch of a migration and queues them at increasing delays.
///
/// Batch `i` (starting at 1) is due `initial_delay + i * interval` after
/// the scheduling moment.
#[derive(Debug, Clone, Copy)]
pub struct Scheduler {
    now: DateTime<Utc>,
    initial_delay: Duration,
}

impl Scheduler {
    /// Schedule relative to `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now,
            initial_delay: Duration::ZERO,
        }
    }

    /// Delay added before the first batch.
    pub fn initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    /// Delay of batch `index` (1-based) after the scheduling moment.
    pub fn dispatch_delay(&self, index: u32, interval: Duration) -> Duration {
        self.initial_delay + interval * index
    }

    /// Walk the migration's table and compute every batch with its dispatch time.
    ///
    /// Keys are read through `conn`, which may be the transaction the
    /// batches are later written in.
    #[instrument(name = "batched_migrations.plan", skip_all, fields(migration.id = migration.id))]
    pub async fn plan(&self, conn: &mut PgConnection, migration: &BatchedMigration) -> Result<Vec<PlannedBatch>> {
        let mut batches = BatchIterator::new(
            migration.table_name.clone(),
            migration.column_names.clone(),
            migration.bounds(),
            i64::from(migration.batch_size),
        );

        let interval = migration.interval();
        let mut planned = Vec::new();

        while let Some(batch) = batches.next_batch(&mut *conn).await? {
            let index = u32::try_from(planned.len() + 1).map_err(|_| {
                Error::InvalidConfiguration("too many batches for a single migration".into())
            })?;
            let delay = self.dispatch_delay(index, interval);

            debug!(batch.range = %batch.range, batch.rows = batch.rows, ?delay, "Planning batch…");

            planned.push(PlannedBatch {
                batch: DelayedBatch {
                    migration_id: migration.id,
                    range: batch.range,
                    batch_size: i32::try_from(batch.rows).unwrap_or(migration.batch_size),
                    sub_batch_size: migration.sub_batch_size.min(migration.batch_size),
                },
                not_before: self.now + to_time_delta(delay)?,
                delay,
            });
        }

        Ok(planned)
    }

    /// Hand planned batches to `queue`, in order.
    pub async fn dispatch<Q: DelayedQueue>(planned: Vec<PlannedBatch>, queue: &mut Q) -> Result<Schedule> {
        let mut schedule = Schedule {
            batches: 0,
            final_delay: Duration::ZERO,
        };
        for PlannedBatch { batch, not_before, delay } in planned {
            queue.enqueue(batch, not_before).await?;
            schedule.batches += 1;
            schedule.final_delay = delay;
        }
        Ok(schedule)
    }

    /// Plan the migration's batches and queue them.
    pub async fn schedule<Q: DelayedQueue>(
        &self,
        conn: &mut PgConnection,
        migration: &BatchedMigration,
        queue: &mut Q,
    ) -> Result<Schedule> {
        let planned = self.plan(conn, migration).await?;
        Self::dispatch(planned, queue).await
    }
}

pub(crate) fn to_time_delta(duration: Duration) -> Result<TimeDelta> {
    TimeDelta::from_std(duration)
        .map_err(|_| Error::InvalidConfiguration(format!("duration {duration:?} is out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryQueue;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn delays_grow_linearly_with_the_interval() {
        let scheduler = Scheduler::new(Utc::now());
        let delays = (1..=3)
            .map(|i| scheduler.dispatch_delay(i, 2 * MINUTE))
            .collect::<Vec<_>>();
        assert_eq!(delays, [2 * MINUTE, 4 * MINUTE, 6 * MINUTE]);
    }

    #[test]
    fn initial_delay_shifts_every_batch() {
        let scheduler = Scheduler::new(Utc::now()).initial_delay(10 * MINUTE);
        assert_eq!(scheduler.dispatch_delay(1, 10 * MINUTE), 20 * MINUTE);
        assert_eq!(scheduler.dispatch_delay(2, 10 * MINUTE), 30 * MINUTE);
    }

    #[tokio::test]
    async fn dispatch_queues_planned_batches_in_order() {
        let now = Utc::now();
        let planned = [(1, 3), (4, 6)]
            .into_iter()
            .zip(1..)
            .map(|((min, max), i)| PlannedBatch {
                batch: DelayedBatch {
                    migration_id: 1,
                    range: BatchRange::new(min, max),
                    batch_size: 3,
                    sub_batch_size: 1,
                },
                not_before: now + TimeDelta::minutes(2 * i),
                delay: 2 * MINUTE * u32::try_from(i).unwrap(),
            })
            .collect::<Vec<_>>();

        let mut queue = MemoryQueue::new();
        let schedule = Scheduler::dispatch(planned, &mut queue).await.unwrap();

        assert_eq!(schedule.batches, 2);
        assert_eq!(schedule.final_delay, 4 * MINUTE);
        assert_eq!(queue.pop_due(now + TimeDelta::minutes(2)).len(), 1);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn memory_queue_receives_batches_in_time_order() {
        let now = Utc::now();
        let mut queue = MemoryQueue::new();
        for (i, (min, max)) in [(1, 3), (4, 6), (7, 7)].into_iter().enumerate() {
            let batch = DelayedBatch {
                migration_id: 1,
                range: BatchRange::new(min, max),
                batch_size: 3,
                sub_batch_size: 1,
            };
            let delay = TimeDelta::minutes(2 * (3 - i64::try_from(i).unwrap()));
            queue.enqueue(batch, now + delay).await.unwrap();
        }

        let due = queue.pop_due(now + TimeDelta::minutes(4));
        let ranges = due.iter().map(|(batch, _)| batch.range.to_string()).collect::<Vec<_>>();
        assert_eq!(ranges, ["[7, 7]", "[4, 6]"]);
        assert_eq!(queue.len(), 1);
    }
}

//! Shared setup for the integration tests.

#![allow(dead_code)]

use batched_migrations::{BatchedMigrationJob, Runner, SubBatch, setup_database};
use serde::Deserialize;
use serde_json::Value;
use sqlx::{PgConnection, PgPool};
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;

/// Set up a test database with `TestContainers` and return the pool and container
pub async fn setup_test_db() -> anyhow::Result<(PgPool, ContainerAsync<Postgres>)> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let container = Postgres::default().start().await?;

    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

    let pool = PgPool::connect(&connection_string).await?;
    setup_database(&pool).await?;

    Ok((pool, container))
}

/// Create `events` with `rows` rows numbered from 1, and an empty `copy` column.
pub async fn create_events_table(pool: &PgPool, rows: i64) -> anyhow::Result<()> {
    sqlx::query("CREATE TABLE events (id BIGSERIAL PRIMARY KEY, value INTEGER NOT NULL, copy INTEGER)")
        .execute(pool)
        .await?;
    sqlx::query("INSERT INTO events (value) SELECT n * 10 FROM generate_series(1, $1) AS n")
        .bind(rows)
        .execute(pool)
        .await?;
    Ok(())
}

/// Make every queued batch due now instead of after its interval.
pub async fn make_batches_due(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::query("UPDATE batched_background_migration_jobs SET run_at = NOW() WHERE status <> 3")
        .execute(pool)
        .await?;
    Ok(())
}

/// Ranges and sizes of every batch, in cursor order.
pub async fn all_batches(pool: &PgPool) -> anyhow::Result<Vec<(Vec<i64>, Vec<i64>, i32)>> {
    Ok(sqlx::query_as(
        r"
        SELECT min_value, max_value, batch_size
        FROM batched_background_migration_jobs
        ORDER BY min_value
        ",
    )
    .fetch_all(pool)
    .await?)
}

/// Copies one column into another: `[["value"], ["copy"]]`.
#[derive(Deserialize)]
pub struct CopyColumn(pub Vec<String>, pub Vec<String>);

impl BatchedMigrationJob for CopyColumn {
    const JOB_CLASS_NAME: &'static str = "CopyColumn";
    type Context = ();

    async fn perform(&self, _ctx: &(), conn: &mut PgConnection, batch: &SubBatch) -> anyhow::Result<()> {
        let sql = format!(
            "UPDATE {table} SET {to} = {from} WHERE {predicate}",
            table = batch.quoted_table(),
            to = batched_migrations::quote_ident(&self.1[0]),
            from = batched_migrations::quote_ident(&self.0[0]),
            predicate = batch.predicate(),
        );
        sqlx::query(&sql).execute(conn).await?;
        Ok(())
    }
}

/// Like [`CopyColumn`], but takes a second for every sub-batch.
#[derive(Deserialize)]
pub struct SlowCopy(pub Vec<String>, pub Vec<String>);

impl BatchedMigrationJob for SlowCopy {
    const JOB_CLASS_NAME: &'static str = "SlowCopy";
    type Context = ();

    async fn perform(&self, ctx: &(), conn: &mut PgConnection, batch: &SubBatch) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_secs(1)).await;
        CopyColumn(self.0.clone(), self.1.clone()).perform(ctx, conn, batch).await
    }
}

/// Fails every sub-batch.
#[derive(Deserialize)]
pub struct AlwaysFails;

impl BatchedMigrationJob for AlwaysFails {
    const JOB_CLASS_NAME: &'static str = "AlwaysFails";
    type Context = ();

    async fn perform(&self, _ctx: &(), _conn: &mut PgConnection, batch: &SubBatch) -> anyhow::Result<()> {
        anyhow::bail!("cannot migrate {}", batch.range)
    }
}

/// Panics on every sub-batch.
#[derive(Deserialize)]
pub struct Panics;

impl BatchedMigrationJob for Panics {
    const JOB_CLASS_NAME: &'static str = "Panics";
    type Context = ();

    async fn perform(&self, _ctx: &(), _conn: &mut PgConnection, _batch: &SubBatch) -> anyhow::Result<()> {
        panic!("transformation panicked")
    }
}

/// A runner knowing every test transformation, stopping once nothing is due.
pub fn create_test_runner(pool: PgPool) -> Runner<(), batched_migrations::Configured> {
    Runner::new(pool, ())
        .register::<CopyColumn>()
        .register::<AlwaysFails>()
        .register::<Panics>()
        .register::<SlowCopy>()
        .num_workers(2)
        .poll_interval(Duration::from_millis(10))
        .jitter(Duration::ZERO)
        .retry_backoff(Duration::ZERO)
        .shutdown_when_queue_empty()
}

/// Job arguments of [`CopyColumn`] over `events`.
pub fn copy_arguments() -> Value {
    serde_json::json!([["value"], ["copy"]])
}

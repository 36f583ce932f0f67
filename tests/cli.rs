#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

mod common;

use batched_migrations::BatchedMigrationJob;
use batched_migrations::cli::Cli;
use clap::Parser;
use common::{CopyColumn, copy_arguments, create_events_table, create_test_runner, setup_test_db};
use sqlx::PgPool;

/// Parse `args` as a command line and run it, returning what it printed.
async fn run(pool: &PgPool, args: &[&str]) -> anyhow::Result<String> {
    let cli = Cli::try_parse_from(
        ["batched-migrations", "--database-url", "postgres://unused"]
            .iter()
            .chain(args),
    )?;
    let finalizer = create_test_runner(pool.clone()).finalizer();

    let mut out = Vec::new();
    cli.command.execute(pool, &finalizer, &mut out).await?;
    Ok(String::from_utf8(out)?)
}

async fn queue_copy_migration(pool: &PgPool) -> anyhow::Result<i64> {
    let outcome = CopyColumn::migration("events", "id")
        .job_arguments(copy_arguments())
        .batch_size(3)
        .sub_batch_size(3)
        .pause_ms(0)
        .queue(pool)
        .await?;
    Ok(outcome.id().unwrap())
}

#[tokio::test]
async fn list_and_show_report_progress() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;
    create_events_table(&pool, 7).await?;
    let id = queue_copy_migration(&pool).await?;

    let listing = run(&pool, &["list"]).await?;
    assert_eq!(
        listing,
        "1\tactive\t0.0%\t{job_class_name: CopyColumn, table_name: events, column_names: [id], \
         job_arguments: [[\"value\"],[\"copy\"]]}\n"
    );
    assert_eq!(run(&pool, &["list", "--status", "failed"]).await?, "");

    let shown: serde_json::Value = serde_json::from_str(&run(&pool, &["show", &id.to_string()]).await?)?;
    assert_eq!(shown["migration"]["status"], "active");
    assert_eq!(shown["progress"]["total_batches"], 3);
    assert_eq!(shown["progress"]["succeeded_batches"], 0);

    let error = run(&pool, &["show", "4242"]).await.unwrap_err();
    assert_eq!(error.to_string(), "Batched background migration 4242 does not exist");

    Ok(())
}

#[tokio::test]
async fn pause_and_resume_change_the_status() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;
    create_events_table(&pool, 7).await?;
    let id = queue_copy_migration(&pool).await?.to_string();

    assert!(run(&pool, &["pause", &id]).await?.starts_with("1\tpaused\t"));
    assert!(run(&pool, &["resume", &id]).await?.starts_with("1\tactive\t"));

    let error = run(&pool, &["retry", &id]).await.unwrap_err();
    assert_eq!(error.to_string(), "Cannot move batched migration 1 from 'active' to 'active'");

    Ok(())
}

#[tokio::test]
async fn finalize_and_delete_take_an_identity() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;
    create_events_table(&pool, 7).await?;
    queue_copy_migration(&pool).await?;

    let identity = ["CopyColumn", "events", "id", r#"[["value"],["copy"]]"#];

    let finalize = [&["finalize"][..], &identity[..]].concat();
    assert_eq!(run(&pool, &finalize).await?, "{\"outcome\":\"finalized\",\"batches\":3}\n");
    assert_eq!(
        run(&pool, &finalize).await?,
        "{\"outcome\":\"already_finished\",\"status\":\"finalized\"}\n"
    );

    let delete = [&["delete"][..], &identity[..]].concat();
    assert!(run(&pool, &delete).await?.starts_with("Deleted "));
    assert!(run(&pool, &delete).await?.starts_with("Nothing to delete for "));
    assert_eq!(run(&pool, &["list"]).await?, "");

    Ok(())
}

#[tokio::test]
async fn prune_deletes_batches_but_keeps_the_migration() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;
    create_events_table(&pool, 7).await?;
    let id = queue_copy_migration(&pool).await?;

    let identity = ["CopyColumn", "events", "id", r#"[["value"],["copy"]]"#];
    let prune = [&["prune"][..], &identity[..]].concat();
    assert!(run(&pool, &prune).await?.starts_with("Deleted 0 batch(es) of "));

    let prune_pending = [&prune[..], &["--status", "pending"][..]].concat();
    assert!(run(&pool, &prune_pending).await?.starts_with("Deleted 3 batch(es) of "));

    let shown: serde_json::Value = serde_json::from_str(&run(&pool, &["show", &id.to_string()]).await?)?;
    assert_eq!(shown["progress"]["total_batches"], 0);

    Ok(())
}

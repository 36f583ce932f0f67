//! Operator command line for batched background migrations.

use anyhow::{Context, Result};
use batched_migrations::Runner;
use batched_migrations::cli::Cli;
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,batched_migrations=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&cli.database_url)
        .await
        .context("Failed to connect to the database")?;
    batched_migrations::setup_database(&pool).await?;

    let finalizer = Runner::new(pool.clone(), ()).finalizer();
    cli.command
        .execute(&pool, &finalizer, &mut std::io::stdout().lock())
        .await
}

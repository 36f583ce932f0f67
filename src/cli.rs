//! Operator commands for inspecting and steering batched migrations.
//!
//! Applications that register transformations can embed [`Cli`] in their
//! own binary so that `finalize` can run them. The bundled binary knows
//! none, so its `finalize` can only confirm migrations that already completed.

use crate::arguments::JobArguments;
use crate::finalizer::Finalizer;
use crate::registration;
use crate::schema::{BatchedMigration, MigrationIdentity};
use crate::status::{JobStatus, MigrationStatus};
use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};
use sqlx::PgPool;
use std::io::Write;

/// Inspect and steer batched background migrations.
#[derive(Debug, Parser)]
#[command(name = "batched-migrations", version)]
pub struct Cli {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: String,

    /// What to do
    #[command(subcommand)]
    pub command: Command,
}

/// Operator commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// List migrations with their progress
    List {
        /// Only list migrations in this status
        #[arg(long)]
        status: Option<MigrationStatus>,
    },
    /// Print a migration and its progress as JSON
    Show {
        /// Migration id
        id: i64,
    },
    /// Stop workers from picking up batches of a migration
    Pause {
        /// Migration id
        id: i64,
    },
    /// Let workers pick up batches of a paused migration again
    Resume {
        /// Migration id
        id: i64,
    },
    /// Reactivate a failed migration and retry its failed batches
    Retry {
        /// Migration id
        id: i64,
    },
    /// Remove a migration and its batches, leaving migrated rows as they are
    Delete(IdentityArgs),
    /// Run the remaining batches of a migration now and mark it finalized
    Finalize(IdentityArgs),
    /// Delete the batches of a migration, keeping the migration record
    Prune {
        /// Migration to prune
        #[command(flatten)]
        identity: IdentityArgs,
        /// Only delete batches in this status, may be repeated
        #[arg(long = "status", default_value = "succeeded")]
        statuses: Vec<JobStatus>,
    },
    /// Rewrite job arguments stored in the legacy flat shape
    NormalizeArguments,
}

/// Identifies a migration the way it was registered.
#[derive(Debug, Args)]
pub struct IdentityArgs {
    /// Name of the transformation
    pub job_class_name: String,
    /// Table the migration walks
    pub table_name: String,
    /// Cursor columns, comma separated
    pub column_names: String,
    /// Job arguments as JSON, `[]` when omitted
    pub job_arguments: Option<String>,
}

impl IdentityArgs {
    /// The identity these arguments describe.
    pub fn identity(&self) -> anyhow::Result<MigrationIdentity> {
        let job_arguments = match &self.job_arguments {
            Some(raw) => serde_json::from_str::<Value>(raw)
                .with_context(|| format!("Job arguments are not valid JSON: {raw}"))?,
            None => Value::Null,
        };
        let column_names = self
            .column_names
            .split(',')
            .map(str::trim)
            .filter(|column| !column.is_empty())
            .collect::<Vec<_>>();
        anyhow::ensure!(!column_names.is_empty(), "At least one cursor column is required");

        Ok(MigrationIdentity::new(&self.job_class_name, &self.table_name, column_names[0])
            .columns(column_names)
            .arguments(JobArguments::normalize(job_arguments)))
    }
}

impl Command {
    /// Run the command, writing its report to `out`.
    pub async fn execute<Context: Clone + Send + Sync + 'static>(
        self,
        pool: &PgPool,
        finalizer: &Finalizer<Context>,
        out: &mut impl Write,
    ) -> anyhow::Result<()> {
        match self {
            Self::List { status } => {
                for migration in registration::list(pool, status).await? {
                    let progress = registration::progress_by_id(pool, migration.id).await?;
                    writeln!(
                        out,
                        "{}\t{}\t{:.1}%\t{}",
                        migration.id,
                        migration.status,
                        progress.percent_complete(),
                        migration.identity()
                    )?;
                }
            }
            Self::Show { id } => {
                let migration = registration::find_by_id(pool, id).await?;
                let progress = registration::progress_by_id(pool, id).await?;
                let report = json!({ "migration": migration, "progress": progress });
                writeln!(out, "{}", serde_json::to_string_pretty(&report)?)?;
            }
            Self::Pause { id } => report(out, &registration::pause(pool, id).await?)?,
            Self::Resume { id } => report(out, &registration::resume(pool, id).await?)?,
            Self::Retry { id } => report(out, &registration::retry_failed(pool, id).await?)?,
            Self::Delete(args) => {
                let identity = args.identity()?;
                if registration::delete_migration(pool, &identity).await? {
                    writeln!(out, "Deleted {identity}")?;
                } else {
                    writeln!(out, "Nothing to delete for {identity}")?;
                }
            }
            Self::Finalize(args) => {
                let identity = args.identity()?;
                let outcome = finalizer.finalize(&identity).await?;
                writeln!(out, "{}", serde_json::to_string(&outcome)?)?;
            }
            Self::Prune { identity, statuses } => {
                let identity = identity.identity()?;
                let deleted = registration::delete_job_tracking(pool, &identity, &statuses).await?;
                writeln!(out, "Deleted {deleted} batch(es) of {identity}")?;
            }
            Self::NormalizeArguments => {
                let rewritten = registration::normalize_legacy_job_arguments(pool).await?;
                writeln!(out, "Normalized {rewritten} batched migration(s)")?;
            }
        }
        Ok(())
    }
}

fn report(out: &mut impl Write, migration: &BatchedMigration) -> std::io::Result<()> {
    writeln!(out, "{}\t{}\t{}", migration.id, migration.status, migration.identity())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_line_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn identities_parse_composite_cursors_and_legacy_arguments() {
        let cli = Cli::try_parse_from([
            "batched-migrations",
            "--database-url",
            "postgres://localhost/db",
            "finalize",
            "BackfillProjectIds",
            "events",
            "user_id, project_id",
            r#"["project_id"]"#,
        ])
        .unwrap();

        let Command::Finalize(args) = cli.command else {
            panic!("expected the finalize command");
        };
        let identity = args.identity().unwrap();
        assert_eq!(identity.column_names, ["user_id", "project_id"]);
        assert_eq!(identity.job_arguments.to_value(), json!([["project_id"]]));
    }

    #[test]
    fn prune_defaults_to_succeeded_batches() {
        let parse = |extra: &[&str]| {
            let args = ["batched-migrations", "--database-url", "postgres://localhost/db", "prune"]
                .iter()
                .chain(["CopyColumn", "events", "id"].iter())
                .chain(extra);
            match Cli::try_parse_from(args).unwrap().command {
                Command::Prune { statuses, .. } => statuses,
                command => panic!("expected the prune command, got {command:?}"),
            }
        };

        assert_eq!(parse(&[]), [JobStatus::Succeeded]);
        assert_eq!(
            parse(&["--status", "failed", "--status", "pending"]),
            [JobStatus::Failed, JobStatus::Pending]
        );
    }

    #[test]
    fn statuses_are_parsed_by_name() {
        let cli = Cli::try_parse_from([
            "batched-migrations",
            "--database-url",
            "postgres://localhost/db",
            "list",
            "--status",
            "failed",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Command::List {
                status: Some(MigrationStatus::Failed)
            }
        ));
    }
}

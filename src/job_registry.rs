use crate::arguments::JobArguments;
use crate::batched_job::{BatchedMigrationJob, SubBatch};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use sqlx::PgConnection;
use std::collections::HashMap;
use std::fmt;

/// Type-erased entry point of a registered transformation.
pub(crate) type PerformFn<Context> = for<'a> fn(
    &'a Context,
    &'a mut PgConnection,
    &'a SubBatch,
    &'a JobArguments,
) -> BoxFuture<'a, anyhow::Result<()>>;

/// Maps job class names to the transformations that implement them.
pub(crate) struct JobRegistry<Context> {
    entries: HashMap<String, PerformFn<Context>>,
}

impl<Context> Default for JobRegistry<Context> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<Context> Clone for JobRegistry<Context> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<Context> fmt::Debug for JobRegistry<Context> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("job_class_names", &self.job_class_names())
            .finish()
    }
}

impl<Context: Clone + Send + Sync + 'static> JobRegistry<Context> {
    pub(crate) fn register<J: BatchedMigrationJob<Context = Context>>(&mut self) {
        self.entries
            .insert(J::JOB_CLASS_NAME.to_string(), perform::<J>);
    }
}

impl<Context> JobRegistry<Context> {
    pub(crate) fn get(&self, job_class_name: &str) -> Option<PerformFn<Context>> {
        self.entries.get(job_class_name).copied()
    }

    pub(crate) fn job_class_names(&self) -> Vec<String> {
        let mut names = self.entries.keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }
}

fn perform<'a, J: BatchedMigrationJob>(
    ctx: &'a J::Context,
    conn: &'a mut PgConnection,
    batch: &'a SubBatch,
    arguments: &'a JobArguments,
) -> BoxFuture<'a, anyhow::Result<()>> {
    async move {
        let job = decode::<J>(arguments)?;
        job.perform(ctx, conn, batch).await
    }
    .boxed()
}

fn decode<J: BatchedMigrationJob>(arguments: &JobArguments) -> anyhow::Result<J> {
    let value = if arguments.is_empty() {
        Value::Null
    } else {
        arguments.to_value()
    };
    serde_json::from_value(value).map_err(|error| {
        anyhow::anyhow!(
            "Failed to decode job arguments for {}: {error}",
            J::JOB_CLASS_NAME
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct NoArguments;

    impl BatchedMigrationJob for NoArguments {
        const JOB_CLASS_NAME: &'static str = "NoArguments";
        type Context = ();

        async fn perform(
            &self,
            _ctx: &Self::Context,
            _conn: &mut PgConnection,
            _batch: &SubBatch,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[derive(Deserialize)]
    struct CopyColumns(Vec<String>, Vec<String>);

    impl BatchedMigrationJob for CopyColumns {
        const JOB_CLASS_NAME: &'static str = "CopyColumns";
        type Context = ();

        async fn perform(
            &self,
            _ctx: &Self::Context,
            _conn: &mut PgConnection,
            _batch: &SubBatch,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn registered_names_are_listed_sorted() {
        let mut registry = JobRegistry::<()>::default();
        registry.register::<NoArguments>();
        registry.register::<CopyColumns>();

        assert_eq!(registry.job_class_names(), ["CopyColumns", "NoArguments"]);
        assert!(registry.get("CopyColumns").is_some());
        assert!(registry.get("Unknown").is_none());
    }

    #[test]
    fn unit_jobs_decode_from_empty_arguments() {
        assert!(decode::<NoArguments>(&JobArguments::empty()).is_ok());
    }

    #[test]
    fn argument_mismatches_name_the_job_class() {
        let arguments = JobArguments::normalize(json!(["only_one"]));
        let error = decode::<CopyColumns>(&arguments).err().unwrap();
        assert!(error.to_string().starts_with("Failed to decode job arguments for CopyColumns"));
    }
}

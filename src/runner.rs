use crate::batch_runner::{BatchRunner, RetryPolicy};
use crate::batched_job::BatchedMigrationJob;
use crate::finalizer::Finalizer;
use crate::job_registry::JobRegistry;
use crate::registration::DEFAULT_GITLAB_SCHEMA;
use crate::worker::Worker;
use futures_util::future::join_all;
use sqlx::PgPool;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{Instrument, info, info_span, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);
const DEFAULT_MAX_ATTEMPTS: i32 = 3;
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(60);

/// Marker type for a configured runner
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Configured;
/// Marker type for an unconfigured runner
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Unconfigured;

/// Runs the due batches of active migrations on background workers.
///
/// Each worker holds one pooled connection while a batch runs and borrows
/// another per sub-batch, so the pool should allow at least two
/// connections per worker.
pub struct Runner<Context: Clone + Send + Sync + 'static, State = Unconfigured> {
    connection_pool: PgPool,
    job_registry: JobRegistry<Context>,
    context: Context,
    num_workers: usize,
    poll_interval: Duration,
    jitter: Duration,
    retry_policy: RetryPolicy,
    gitlab_schema: String,
    shutdown_when_queue_empty: bool,
    _state: PhantomData<State>,
}

impl<Context: std::fmt::Debug + Clone + Sync + Send, State: std::fmt::Debug> std::fmt::Debug
    for Runner<Context, State>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("job_class_names", &self.job_registry.job_class_names())
            .field("context", &self.context)
            .field("num_workers", &self.num_workers)
            .field("gitlab_schema", &self.gitlab_schema)
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .finish()
    }
}

impl<Context: Clone + Send + Sync + 'static> Runner<Context> {
    /// Create a new runner with the given connection pool and context.
    pub fn new(connection_pool: PgPool, context: Context) -> Self {
        Self {
            connection_pool,
            job_registry: JobRegistry::default(),
            context,
            num_workers: 1,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
            retry_policy: RetryPolicy {
                max_attempts: DEFAULT_MAX_ATTEMPTS,
                retry_backoff: DEFAULT_RETRY_BACKOFF,
            },
            gitlab_schema: DEFAULT_GITLAB_SCHEMA.to_string(),
            shutdown_when_queue_empty: false,
            _state: PhantomData,
        }
    }
}

impl<Context: Clone + Send + Sync + 'static, State> Runner<Context, State> {
    /// Make a transformation available to the workers and the finalizer.
    pub fn register<J: BatchedMigrationJob<Context = Context>>(mut self) -> Runner<Context, Configured> {
        self.job_registry.register::<J>();
        Runner {
            connection_pool: self.connection_pool,
            job_registry: self.job_registry,
            context: self.context,
            num_workers: self.num_workers,
            poll_interval: self.poll_interval,
            jitter: self.jitter,
            retry_policy: self.retry_policy,
            gitlab_schema: self.gitlab_schema,
            shutdown_when_queue_empty: self.shutdown_when_queue_empty,
            _state: PhantomData,
        }
    }

    /// Set the number of worker tasks.
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Set how often idle workers look for due batches.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter to add to poll intervals.
    ///
    /// Jitter helps reduce thundering herd effects when multiple workers
    /// are polling simultaneously. The actual jitter applied will be a
    /// random value between 0 and the specified duration.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set how many times a batch is attempted before its migration fails.
    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.retry_policy.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the delay before the first retry of a failed batch; later retries double it.
    pub fn retry_backoff(mut self, retry_backoff: Duration) -> Self {
        self.retry_policy.retry_backoff = retry_backoff;
        self
    }

    /// Only run migrations of this logical database.
    pub fn gitlab_schema(mut self, gitlab_schema: impl Into<String>) -> Self {
        self.gitlab_schema = gitlab_schema.into();
        self
    }

    /// Set the runner to shut down once no batch is due.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }

    /// A finalizer that knows the transformations registered so far.
    pub fn finalizer(&self) -> Finalizer<Context> {
        Finalizer {
            batch_runner: self.batch_runner(),
            retry_policy: self.retry_policy,
            delete_tracking: Vec::new(),
        }
    }

    fn batch_runner(&self) -> BatchRunner<Context> {
        BatchRunner {
            connection_pool: self.connection_pool.clone(),
            context: self.context.clone(),
            job_registry: Arc::new(self.job_registry.clone()),
        }
    }
}

impl<Context: Clone + Send + Sync + 'static> Runner<Context, Configured> {
    /// Start the background workers.
    ///
    /// This returns a `RunHandle` which can be used to wait for the workers to shutdown.
    pub fn start(&self) -> RunHandle {
        let mut handles = Vec::new();
        for i in 1..=self.num_workers {
            let name = format!("batched-migration-worker-{i}");
            info!(worker.name = %name, "Starting worker…");

            let worker = Worker {
                batch_runner: self.batch_runner(),
                gitlab_schema: self.gitlab_schema.clone(),
                retry_policy: self.retry_policy,
                shutdown_when_queue_empty: self.shutdown_when_queue_empty,
                poll_interval: self.poll_interval,
                jitter: self.jitter,
            };

            let span = info_span!("worker", worker.name = %name);
            let handle = tokio::spawn(async move { worker.run().instrument(span).await });

            handles.push(handle);
        }

        RunHandle { handles }
    }
}

/// Handle to the running background workers
#[derive(Debug)]
pub struct RunHandle {
    handles: Vec<JoinHandle<()>>,
}

impl RunHandle {
    /// Wait for all background workers to shut down.
    pub async fn wait_for_shutdown(self) {
        join_all(self.handles).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "Background worker task panicked");
            }
        });
    }
}

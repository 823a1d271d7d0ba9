//! Fixed-size load against a single function target.
//!
//! A [`LoadGenerator`] plans all requests upfront: it fills a queue with exactly
//! `total_requests` [`Task`]s and seals it, so workers only ever drain it. The generator owns the
//! [`ArchiveClient`] every successful result is written to, and the HTTP client shared by its
//! workers.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use crossbeam_channel::Receiver;
use thiserror::Error;
use tokio::task::JoinSet;

use crate::archive::{
    ArchiveClient, ArchiveError, ArchiveFile, DEFAULT_SHUTDOWN_GRACE, RunMetadata,
};
use crate::config::{BenchmarkFunctionConfig, WorkloadParameters};
use crate::events::Events;
use crate::provider::Provider;

mod task;
mod worker;

pub use task::{AttemptError, DEFAULT_BACKOFF_BASE, RetryPolicy, Task, TaskError};
pub use worker::Worker;

/// Timeout of a single request, including reading the body.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// The maximum number of parallel requests against a single Azure function.
pub const AZURE_MAX_PARALLEL_REQUESTS: usize = 300;

/// Errors setting up or running a [`LoadGenerator`].
#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("failed to build HTTP client")]
    Client(#[source] reqwest::Error),

    #[error("task queue rejected a task")]
    Queue,
}

/// Snapshot of the task queue of a [`LoadGenerator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueState {
    pub total: usize,
    pub remaining: usize,
}

impl QueueState {
    /// The number of tasks taken by workers so far.
    pub fn dequeued(&self) -> usize {
        self.total - self.remaining
    }
}

/// Builder for a [`LoadGenerator`] with non-default timings.
#[derive(Debug)]
pub struct LoadGeneratorBuilder {
    params: WorkloadParameters,
    function: BenchmarkFunctionConfig,
    backoff_base: Duration,
    archive_grace: Duration,
    started_at: Option<DateTime<Local>>,
}

impl LoadGeneratorBuilder {
    /// Base delay of the exponential retry backoff.
    pub fn backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Grace period after stopping the archive.
    pub fn archive_grace(mut self, grace: Duration) -> Self {
        self.archive_grace = grace;
        self
    }

    /// Start time of the benchmark run, used for the archive location and metadata.
    ///
    /// Defaults to the time of [`build`](Self::build).
    pub fn started_at(mut self, started_at: DateTime<Local>) -> Self {
        self.started_at = Some(started_at);
        self
    }

    /// Creates the archive, fills and seals the task queue.
    pub fn build(self) -> Result<LoadGenerator, LoadError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(LoadError::Client)?;

        let started_at = self.started_at.unwrap_or_else(Local::now);
        let path = archive_path(&self.params.result_folder, started_at, &self.function);
        let metadata = RunMetadata::new(&self.params, &self.function, started_at);
        let archive = ArchiveFile::create(path, &metadata)?
            .shutdown_grace(self.archive_grace)
            .start();

        let function = Arc::new(self.function);
        let total = self.params.total_requests;

        // a zero-capacity crossbeam channel would block on every send
        let (sender, queue) = crossbeam_channel::bounded(total.max(1));
        for _ in 0..total {
            let task = Task {
                function: Arc::clone(&function),
                archive: archive.clone(),
            };
            sender.try_send(task).map_err(|_| LoadError::Queue)?;
        }
        drop(sender);

        Ok(LoadGenerator {
            function,
            parallel_requests: self.params.parallel_requests,
            total,
            queue,
            archive,
            client,
            retry: RetryPolicy {
                retries: self.params.retries_per_request,
                base: self.backoff_base,
            },
        })
    }
}

/// Runs a fixed number of requests against one function target with a pool of workers.
#[derive(Debug)]
pub struct LoadGenerator {
    function: Arc<BenchmarkFunctionConfig>,
    parallel_requests: usize,
    total: usize,
    queue: Receiver<Task>,
    archive: ArchiveClient,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl LoadGenerator {
    /// Creates a generator with production timings.
    ///
    /// The archive is created right away, see [`LoadGeneratorBuilder::build`].
    pub fn new(
        params: &WorkloadParameters,
        function: BenchmarkFunctionConfig,
    ) -> Result<Self, LoadError> {
        Self::builder(params, function).build()
    }

    pub fn builder(
        params: &WorkloadParameters,
        function: BenchmarkFunctionConfig,
    ) -> LoadGeneratorBuilder {
        LoadGeneratorBuilder {
            params: params.clone(),
            function,
            backoff_base: DEFAULT_BACKOFF_BASE,
            archive_grace: DEFAULT_SHUTDOWN_GRACE,
            started_at: None,
        }
    }

    pub fn function(&self) -> &BenchmarkFunctionConfig {
        &self.function
    }

    pub fn archive_path(&self) -> &Path {
        self.archive.path()
    }

    /// Returns the total number of tasks and the number not yet taken by a worker.
    pub fn queue_state(&self) -> QueueState {
        QueueState {
            total: self.total,
            remaining: self.queue.len(),
        }
    }

    /// Drains the task queue with `parallel_requests` workers, then stops the archive.
    ///
    /// Failed tasks are reported as `task_execution` events and never abort the run.
    pub async fn run(&self, events: &Events) -> Result<(), LoadError> {
        let function = &self.function;
        events.info(
            "load_generator_start",
            format!(
                "({}: {}) Starting load generator for {} with {} workers and {} requests",
                function.provider, function.region, function.name, self.parallel_requests, self.total
            ),
        );

        let mut workers = JoinSet::new();
        for id in 0..self.parallel_requests {
            let worker = Worker {
                id,
                queue: self.queue.clone(),
                client: self.client.clone(),
                retry: self.retry,
                events: events.clone(),
            };
            workers.spawn(worker.run());
        }

        while let Some(result) = workers.join_next().await {
            if let Err(err) = result {
                tracing::error!(
                    function = %function.name,
                    error = &err as &dyn std::error::Error,
                    "load generator worker failed"
                );
            }
        }

        self.archive.stop().await?;

        events.info(
            "function_finished",
            format!(
                "({}: {}) Finished benchmarking {}",
                function.provider, function.region, function.name
            ),
        );
        Ok(())
    }
}

/// Limits the parallelism of Azure functions to [`AZURE_MAX_PARALLEL_REQUESTS`].
///
/// Publishes an `azure_limitations` warning when the limit applies.
pub fn cap_parallelism(params: &mut WorkloadParameters, provider: Provider, events: &Events) {
    if provider == Provider::Azure && params.parallel_requests > AZURE_MAX_PARALLEL_REQUESTS {
        events.warning(
            "azure_limitations",
            format!(
                "Azure functions support at most {AZURE_MAX_PARALLEL_REQUESTS} parallel requests, \
                 reducing parallelRequests from {}",
                params.parallel_requests
            ),
        );
        params.parallel_requests = AZURE_MAX_PARALLEL_REQUESTS;
    }
}

/// Returns `{result_folder}/{YYYY-MM-DD_HH-MM}/{provider}/{region}/{name}.log`.
pub fn archive_path(
    result_folder: &Path,
    started_at: DateTime<Local>,
    function: &BenchmarkFunctionConfig,
) -> PathBuf {
    result_folder
        .join(started_at.format("%Y-%m-%d_%H-%M").to_string())
        .join(function.provider.as_str())
        .join(&function.region)
        .join(format!("{}.log", function.name))
}

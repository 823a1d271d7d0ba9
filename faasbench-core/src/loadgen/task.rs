use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

use crate::archive::{ArchiveClient, ArchiveError};
use crate::config::BenchmarkFunctionConfig;
use crate::response::{BenchmarkResponse, DecodeError};

/// Base delay of the exponential backoff between attempts.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// A single failed attempt of a task.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("request failed")]
    Request(#[source] reqwest::Error),
    #[error("unexpected status code {0}")]
    Status(StatusCode),
}

/// Errors executing a single [`Task`].
#[derive(Debug, Error)]
pub enum TaskError {
    /// Every attempt failed. The task is dropped.
    #[error("{function}: giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        function: String,
        attempts: u32,
        #[source]
        last: AttemptError,
    },

    /// The function answered with a body that is not a benchmark result. Not retried.
    #[error("{function}: {source}")]
    Decode {
        function: String,
        #[source]
        source: DecodeError,
    },

    #[error("{function}: failed to serialize benchmark result")]
    Serialize {
        function: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{function}: failed to archive benchmark result")]
    Archive {
        function: String,
        #[source]
        source: ArchiveError,
    },
}

/// How often and how patiently a failed request is repeated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt.
    pub retries: u32,
    /// Delay before the first retry. Doubles with every further retry.
    pub base: Duration,
}

impl RetryPolicy {
    pub fn new(retries: u32) -> Self {
        Self {
            retries,
            base: DEFAULT_BACKOFF_BASE,
        }
    }

    /// The total number of attempts, including the first one.
    pub fn attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// The delay after the failed attempt with the given zero-based index.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor)
    }

    /// Runs `attempt` until it succeeds or all attempts have failed.
    ///
    /// Sleeps for the backoff between attempts, but not after the last one. On failure, returns
    /// the error of the last attempt.
    pub async fn run<T, E, F, Fut>(&self, mut attempt: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let attempts = self.attempts();
        let mut index = 0;

        loop {
            let error = match attempt(index).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            index += 1;
            if index >= attempts {
                return Err(error);
            }
            tokio::time::sleep(self.backoff(index - 1)).await;
        }
    }
}

/// One planned request against a function target.
///
/// All tasks of a load generator share the same function config and archive.
#[derive(Clone, Debug)]
pub struct Task {
    pub function: Arc<BenchmarkFunctionConfig>,
    pub archive: ArchiveClient,
}

impl Task {
    /// Requests the function until it answers with status 200, then archives the decoded
    /// result.
    pub async fn execute(
        &self,
        client: &reqwest::Client,
        retry: &RetryPolicy,
    ) -> Result<(), TaskError> {
        let response = self.request_with_retries(client, retry).await?;

        let result = BenchmarkResponse::decode(response)
            .await
            .map_err(|source| TaskError::Decode {
                function: self.function.name.clone(),
                source,
            })?;
        let line = result.to_line().map_err(|source| TaskError::Serialize {
            function: self.function.name.clone(),
            source,
        })?;

        self.archive
            .write(line)
            .map_err(|source| TaskError::Archive {
                function: self.function.name.clone(),
                source,
            })
    }

    async fn request_with_retries(
        &self,
        client: &reqwest::Client,
        retry: &RetryPolicy,
    ) -> Result<reqwest::Response, TaskError> {
        let result = retry
            .run(|attempt| async move {
                let error = match self.request(client).await {
                    Ok(response) if response.status() == StatusCode::OK => return Ok(response),
                    Ok(response) => AttemptError::Status(response.status()),
                    Err(err) => AttemptError::Request(err),
                };

                tracing::debug!(
                    function = %self.function.name,
                    attempt,
                    error = &error as &dyn std::error::Error,
                    "request attempt failed"
                );
                Err(error)
            })
            .await;

        result.map_err(|last| TaskError::RetriesExhausted {
            function: self.function.name.clone(),
            attempts: retry.attempts(),
            last,
        })
    }

    async fn request(&self, client: &reqwest::Client) -> reqwest::Result<reqwest::Response> {
        let mut request = client.get(&self.function.url);
        if let Some((key, value)) = self.function.auth.header() {
            request = request.header(key, value);
        }
        request.send().await
    }
}

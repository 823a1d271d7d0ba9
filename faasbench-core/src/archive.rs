//! Asynchronous NDJSON result archive of a single function target.
//!
//! An archive is created in two steps. [`ArchiveFile::create`] creates the file and persists the
//! [`RunMetadata`] as the first line, so the metadata survives even if no result follows.
//! [`ArchiveFile::start`] then spawns the single writer task and returns the [`ArchiveClient`]
//! handle shared by all workers.
//!
//! The writer task is the only owner of the file and its buffer. Workers hand lines over through
//! an unbounded queue, so lines are appended in the order they were handed over without any
//! locking on the write path.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Local, SecondsFormat};
use futures::future;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{BenchmarkFunctionConfig, WorkloadParameters};

/// Buffer size used when the filesystem block size cannot be determined.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Time [`ArchiveClient::stop`] waits after the final flush, so that events about the shutdown
/// can still be written before the process moves on.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Errors of the result archive.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Creating, writing or flushing the archive file failed.
    #[error("archive i/o error: {context}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// The run metadata could not be serialized.
    #[error("failed to serialize archive metadata")]
    Metadata(#[source] serde_json::Error),

    /// The archive no longer accepts writes.
    #[error("archive is stopped")]
    Stopped,

    /// The writer task panicked or was cancelled.
    #[error("archive writer task failed")]
    Writer(#[source] tokio::task::JoinError),
}

impl ArchiveError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Description of a benchmark run, written as the first line of every archive.
///
/// All values are serialized as strings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RunMetadata {
    pub timestamp: String,
    pub url: String,
    pub function: String,
    #[serde(rename = "parallel-requests")]
    pub parallel_requests: String,
    #[serde(rename = "iterationsPerBenchmark")]
    pub iterations: String,
    pub retries: String,
    pub provider: String,
    pub region: String,
    #[serde(rename = "memorySize")]
    pub memory_size: String,
}

impl RunMetadata {
    pub fn new(
        params: &WorkloadParameters,
        function: &BenchmarkFunctionConfig,
        started_at: DateTime<Local>,
    ) -> Self {
        Self {
            timestamp: started_at.to_rfc3339_opts(SecondsFormat::Secs, false),
            url: function.url.clone(),
            function: function.name.clone(),
            parallel_requests: params.parallel_requests.to_string(),
            iterations: params.total_requests.to_string(),
            retries: params.retries_per_request.to_string(),
            provider: function.provider.to_string(),
            region: function.region.clone(),
            memory_size: function.memory_size.to_string(),
        }
    }
}

/// A created archive file holding the metadata line, not yet accepting results.
#[derive(Debug)]
pub struct ArchiveFile {
    path: PathBuf,
    file: fs::File,
    buffer_size: usize,
    shutdown_grace: Duration,
}

impl ArchiveFile {
    /// Creates (or truncates) the archive at `path` and writes the metadata line.
    ///
    /// Parent directories are created as needed. The metadata line is flushed before this
    /// returns.
    pub fn create(path: impl Into<PathBuf>, metadata: &RunMetadata) -> Result<Self, ArchiveError> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| ArchiveError::io("failed to create directories", err))?;
        }

        let mut file = fs::File::create(&path)
            .map_err(|err| ArchiveError::io("failed to create file", err))?;
        let buffer_size = block_size(&file);

        let mut line = serde_json::to_vec(metadata).map_err(ArchiveError::Metadata)?;
        line.push(b'\n');

        let mut writer = io::BufWriter::with_capacity(buffer_size, &mut file);
        writer
            .write_all(&line)
            .map_err(|err| ArchiveError::io("failed to add metadata to file", err))?;
        writer
            .flush()
            .map_err(|err| ArchiveError::io("failed to flush metadata to file", err))?;
        drop(writer);

        tracing::debug!(path = %path.display(), buffer_size, "created archive");

        Ok(Self {
            path,
            file,
            buffer_size,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        })
    }

    /// Overrides the [grace period](DEFAULT_SHUTDOWN_GRACE) of [`ArchiveClient::stop`].
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// The size of the write buffer, derived from the filesystem block size.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Spawns the writer task and registers the archive with the process interrupt handler.
    ///
    /// On SIGINT or SIGTERM, the handler stops every running archive and then exits the process,
    /// so buffered results are flushed rather than lost. Must be called within a tokio runtime.
    pub fn start(self) -> ArchiveClient {
        let (requests, receiver) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let file = tokio::fs::File::from_std(self.file);
        let writer = BufWriter::with_capacity(self.buffer_size, file);
        let writer = tokio::spawn(write_lines(writer, receiver, shutdown.clone()));

        let inner = Arc::new(ArchiveInner {
            path: self.path,
            requests,
            shutdown,
            writer: Mutex::new(Some(writer)),
            shutdown_grace: self.shutdown_grace,
        });

        INTERRUPTS.register(Arc::downgrade(&inner));
        INTERRUPTS.ensure_handler();

        ArchiveClient(inner)
    }
}

enum Request {
    Line(String),
    Flush(oneshot::Sender<io::Result<()>>),
}

/// Shared handle to a running archive.
#[derive(Clone, Debug)]
pub struct ArchiveClient(Arc<ArchiveInner>);

#[derive(Debug)]
struct ArchiveInner {
    path: PathBuf,
    requests: mpsc::UnboundedSender<Request>,
    shutdown: CancellationToken,
    writer: Mutex<Option<JoinHandle<io::Result<()>>>>,
    shutdown_grace: Duration,
}

impl ArchiveClient {
    pub fn path(&self) -> &Path {
        &self.0.path
    }

    /// Queues `line` to be appended to the archive, followed by a newline.
    ///
    /// Never waits for disk I/O. Fails once the archive has been stopped.
    pub fn write(&self, line: impl Into<String>) -> Result<(), ArchiveError> {
        if self.0.shutdown.is_cancelled() {
            return Err(ArchiveError::Stopped);
        }

        let mut line = line.into();
        line.push('\n');
        self.0
            .requests
            .send(Request::Line(line))
            .map_err(|_| ArchiveError::Stopped)
    }

    /// Flushes all lines queued so far to the file, without stopping the archive.
    pub async fn flush(&self) -> Result<(), ArchiveError> {
        let (sender, receiver) = oneshot::channel();
        self.0
            .requests
            .send(Request::Flush(sender))
            .map_err(|_| ArchiveError::Stopped)?;

        receiver
            .await
            .map_err(|_| ArchiveError::Stopped)?
            .map_err(|err| ArchiveError::io("failed to flush archive", err))
    }

    /// Stops accepting writes, drains all queued lines, flushes the file and waits for the
    /// shutdown grace period.
    ///
    /// Calling this again after the archive has stopped returns immediately.
    pub async fn stop(&self) -> Result<(), ArchiveError> {
        self.0.stop().await
    }
}

impl ArchiveInner {
    async fn stop(&self) -> Result<(), ArchiveError> {
        self.shutdown.cancel();

        let mut writer = self.writer.lock().await;
        let Some(handle) = writer.take() else {
            return Ok(());
        };

        let result = match handle.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(ArchiveError::io("failed to flush archive", err)),
            Err(err) => Err(ArchiveError::Writer(err)),
        };

        tracing::debug!(path = %self.path.display(), "stopped archive");
        tokio::time::sleep(self.shutdown_grace).await;

        result
    }
}

async fn write_lines(
    mut writer: BufWriter<tokio::fs::File>,
    mut requests: mpsc::UnboundedReceiver<Request>,
    shutdown: CancellationToken,
) -> io::Result<()> {
    loop {
        tokio::select! {
            biased;

            request = requests.recv() => match request {
                Some(request) => handle_request(&mut writer, request).await,
                None => break,
            },
            _ = shutdown.cancelled() => {
                requests.close();
                while let Some(request) = requests.recv().await {
                    handle_request(&mut writer, request).await;
                }
                break;
            }
        }
    }

    writer.flush().await
}

async fn handle_request(writer: &mut BufWriter<tokio::fs::File>, request: Request) {
    match request {
        Request::Line(line) => {
            // a single failed write must not halt the archive
            if let Err(err) = writer.write_all(line.as_bytes()).await {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "error writing to archive"
                );
            }
        }
        Request::Flush(reply) => {
            reply.send(writer.flush().await).ok();
        }
    }
}

/// The archives of this process that are flushed on SIGINT or SIGTERM.
static INTERRUPTS: LazyLock<InterruptRegistry> = LazyLock::new(InterruptRegistry::default);

/// Running archives and the single signal handler that stops all of them.
#[derive(Debug, Default)]
struct InterruptRegistry {
    archives: std::sync::Mutex<Vec<Weak<ArchiveInner>>>,
    handler: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl InterruptRegistry {
    fn register(&self, archive: Weak<ArchiveInner>) {
        let mut archives = self.archives.lock().unwrap_or_else(PoisonError::into_inner);
        archives.retain(|archive| archive.strong_count() > 0);
        archives.push(archive);
    }

    /// Archives that have not been dropped yet.
    fn live(&self) -> Vec<Arc<ArchiveInner>> {
        let archives = self.archives.lock().unwrap_or_else(PoisonError::into_inner);
        archives.iter().filter_map(Weak::upgrade).collect()
    }

    /// Spawns the signal handler unless one is running on a live runtime.
    fn ensure_handler(&'static self) {
        let mut handler = self.handler.lock().unwrap_or_else(PoisonError::into_inner);
        if handler.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        *handler = Some(tokio::spawn(self.stop_on_interrupt()));
    }

    /// Stops all live archives concurrently.
    async fn stop_all(&self) {
        let archives = self.live();
        tracing::info!(archives = archives.len(), "interrupted, flushing archives");

        let results = future::join_all(archives.iter().map(|inner| inner.stop())).await;
        for (inner, result) in archives.iter().zip(results) {
            if let Err(err) = result {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    path = %inner.path.display(),
                    "failed to stop archive"
                );
            }
        }
    }

    async fn stop_on_interrupt(&self) {
        if let Err(err) = termination_signal().await {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "failed to install interrupt handler"
            );
            return;
        }

        self.stop_all().await;
        std::process::exit(0);
    }
}

#[cfg(unix)]
async fn termination_signal() -> io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn termination_signal() -> io::Result<()> {
    tokio::signal::ctrl_c().await
}

#[cfg(unix)]
fn block_size(file: &fs::File) -> usize {
    use std::os::unix::fs::MetadataExt;

    match file.metadata() {
        Ok(metadata) if metadata.blksize() > 0 => metadata.blksize() as usize,
        Ok(_) => DEFAULT_BUFFER_SIZE,
        Err(err) => {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "failed to get block size, using default buffer size"
            );
            DEFAULT_BUFFER_SIZE
        }
    }
}

#[cfg(not(unix))]
fn block_size(_file: &fs::File) -> usize {
    DEFAULT_BUFFER_SIZE
}

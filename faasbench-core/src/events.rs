//! The lossy, severity-tagged event bus reporting benchmark progress.
//!
//! Every component reports progress and failures through an [`Events`] handle. Publishing never
//! blocks: the [`EventBus`] buffers a bounded number of pending events, and drops new events once
//! that buffer is saturated. A single consumer task drains the buffer and writes one line per
//! event:
//!
//! ```text
//! [2025-01-01T12:00:00+01:00] [info] [load_generator_start] (aws: eu-central-1) Starting ...
//! ```
//!
//! Event kinds containing a provider name are colored per provider for readability.
//!
//! Internal diagnostics go through `tracing` instead, including the notice for dropped events.

use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local, SecondsFormat};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use yansi::{Color, Paint};

/// Maximum number of pending events before new events are dropped.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Severity of an [`Event`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }

    fn color(self) -> Color {
        match self {
            Severity::Info => Color::Cyan,
            Severity::Warning => Color::Yellow,
            Severity::Error => Color::Red,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single progress or failure report.
#[derive(Clone, Debug)]
pub struct Event {
    pub time: DateTime<Local>,
    pub severity: Severity,
    /// A short machine-readable tag, such as `task_execution`.
    pub kind: String,
    pub message: String,
}

impl Event {
    /// Creates an event stamped with the current local time.
    pub fn new(severity: Severity, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            time: Local::now(),
            severity,
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] [{}] [{}] {}",
            self.time.to_rfc3339_opts(SecondsFormat::Secs, false),
            self.severity,
            self.kind,
            self.message
        )
    }
}

/// Destination of published events.
///
/// Implementations must not block the caller.
pub trait EventSink: Send + Sync + 'static {
    fn publish(&self, event: Event);
}

/// Cloneable handle for publishing events to a shared [`EventSink`].
#[derive(Clone)]
pub struct Events(Arc<dyn EventSink>);

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Events").finish_non_exhaustive()
    }
}

impl Events {
    pub fn new(sink: impl EventSink) -> Self {
        Self(Arc::new(sink))
    }

    /// Publishes an event stamped with the current time.
    pub fn send(&self, severity: Severity, kind: impl Into<String>, message: impl Into<String>) {
        self.0.publish(Event::new(severity, kind, message));
    }

    pub fn info(&self, kind: impl Into<String>, message: impl Into<String>) {
        self.send(Severity::Info, kind, message);
    }

    pub fn warning(&self, kind: impl Into<String>, message: impl Into<String>) {
        self.send(Severity::Warning, kind, message);
    }

    pub fn error(&self, kind: impl Into<String>, message: impl Into<String>) {
        self.send(Severity::Error, kind, message);
    }

    /// Publishes every line of `reader` as an `info` event of the given kind.
    ///
    /// A read failure ends the stream with a single `error` event.
    pub async fn stream_lines<R>(&self, reader: R, kind: &str)
    where
        R: AsyncRead + Unpin,
    {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => self.info(kind, line),
                Ok(None) => break,
                Err(err) => {
                    self.error(kind, format!("error reading pipe: {err}"));
                    break;
                }
            }
        }
    }
}

/// Builder for an [`EventBus`].
#[derive(Debug)]
pub struct EventBusBuilder {
    capacity: usize,
    colors: bool,
}

impl EventBusBuilder {
    /// Maximum number of pending events. A capacity of zero holds a single event.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Whether event lines are colored with ANSI escape codes.
    pub fn colors(mut self, colors: bool) -> Self {
        self.colors = colors;
        self
    }

    /// Starts a bus writing event lines to stdout.
    pub fn start(self) -> EventBus {
        self.start_with_writer(io::stdout())
    }

    /// Starts a bus writing event lines to the given writer.
    ///
    /// Must be called within a tokio runtime.
    pub fn start_with_writer<W>(self, writer: W) -> EventBus
    where
        W: Write + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let shutdown = CancellationToken::new();
        let consumer = tokio::spawn(consume(receiver, shutdown.clone(), writer, self.colors));

        EventBus {
            sender,
            shutdown,
            consumer,
        }
    }
}

/// The process-wide event channel with a single consumer task.
#[derive(Debug)]
pub struct EventBus {
    sender: mpsc::Sender<Event>,
    shutdown: CancellationToken,
    consumer: JoinHandle<()>,
}

impl EventBus {
    pub fn builder() -> EventBusBuilder {
        EventBusBuilder {
            capacity: DEFAULT_CAPACITY,
            colors: true,
        }
    }

    /// Returns a handle publishing into this bus.
    pub fn events(&self) -> Events {
        Events::new(ChannelSink {
            sender: self.sender.clone(),
        })
    }

    /// Closes the channel and waits until the consumer has written all pending events.
    ///
    /// Events published after this are dropped.
    pub async fn close(self) {
        self.shutdown.cancel();
        if let Err(err) = self.consumer.await {
            tracing::error!(error = &err as &dyn std::error::Error, "event consumer failed");
        }
    }
}

/// Publishes into the bounded bus channel without waiting for capacity.
struct ChannelSink {
    sender: mpsc::Sender<Event>,
}

impl EventSink for ChannelSink {
    fn publish(&self, event: Event) {
        match self.sender.try_send(event) {
            Ok(()) => (),
            Err(TrySendError::Full(event)) => {
                tracing::warn!(
                    kind = %event.kind,
                    "event channel is full, dropping event: {}",
                    event.message
                );
            }
            Err(TrySendError::Closed(event)) => {
                tracing::warn!(
                    kind = %event.kind,
                    "event channel is closed, dropping event: {}",
                    event.message
                );
            }
        }
    }
}

async fn consume<W: Write>(
    mut receiver: mpsc::Receiver<Event>,
    shutdown: CancellationToken,
    mut writer: W,
    colors: bool,
) {
    loop {
        tokio::select! {
            biased;

            event = receiver.recv() => match event {
                Some(event) => write_event(&mut writer, &event, colors),
                None => break,
            },
            _ = shutdown.cancelled() => {
                receiver.close();
                while let Some(event) = receiver.recv().await {
                    write_event(&mut writer, &event, colors);
                }
                break;
            }
        }
    }

    writer.flush().ok();
}

fn write_event<W: Write>(writer: &mut W, event: &Event, colors: bool) {
    let result = if colors {
        writeln!(
            writer,
            "[{}] [{}] [{}] {}",
            event.time.to_rfc3339_opts(SecondsFormat::Secs, false),
            event.severity.as_str().paint(event.severity.color()),
            paint_kind(&event.kind),
            event.message
        )
    } else {
        writeln!(writer, "{event}")
    };

    if let Err(err) = result {
        tracing::error!(error = &err as &dyn std::error::Error, "failed to write event");
    }
}

/// Colors event kinds mentioning a provider in that provider's color band.
fn paint_kind(kind: &str) -> yansi::Painted<&str> {
    let lower = kind.to_lowercase();
    if lower.contains("gcp") {
        kind.yellow()
    } else if lower.contains("aws") {
        kind.fixed(208)
    } else if lower.contains("azure") {
        kind.green()
    } else if lower.contains("alibaba") {
        kind.magenta()
    } else {
        kind.primary()
    }
}

/// An [`EventSink`] keeping every event in memory.
#[derive(Clone, Debug, Default)]
pub struct MemorySink(Arc<Mutex<Vec<Event>>>);

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a handle publishing into this sink.
    pub fn events(&self) -> Events {
        Events::new(self.clone())
    }

    /// Returns a snapshot of all events published so far.
    pub fn snapshot(&self) -> Vec<Event> {
        self.0.lock().map(|events| events.clone()).unwrap_or_default()
    }

    /// Returns all events of the given kind.
    pub fn of_kind(&self, kind: &str) -> Vec<Event> {
        self.snapshot()
            .into_iter()
            .filter(|event| event.kind == kind)
            .collect()
    }
}

impl EventSink for MemorySink {
    fn publish(&self, event: Event) {
        if let Ok(mut events) = self.0.lock() {
            events.push(event);
        }
    }
}

//! A minimal sequential or parallel runner for named steps.
//!
//! A [`Timeline`] runs independent units of work, such as one load generator per function target
//! or one deployment per provider region, and reports the outcome through [`Events`]:
//!
//! ```no_run
//! # async fn example(events: faasbench_core::events::Events) {
//! use faasbench_core::timeline::{RunMode, Timeline};
//!
//! let result = Timeline::new("Deploy All Targets", RunMode::Parallel)
//!     .step("aws:eu-central-1", |events| async move {
//!         events.info("deploy_aws", "deploying");
//!         anyhow::Ok(())
//!     })
//!     .run(&events)
//!     .await;
//! # }
//! ```
//!
//! In [sequential](RunMode::Sequential) mode the first failing step ends the run. In
//! [parallel](RunMode::Parallel) mode every step runs to completion and all failures are
//! reported together. A panicking step counts as a failed step in both modes.

use std::fmt;
use std::future::Future;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};

use futures::FutureExt;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::task::{JoinError, JoinSet};

use crate::events::Events;

type StepFn = Box<dyn FnOnce(Events) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// How the steps of a [`Timeline`] are executed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    /// One after another in registration order, stopping at the first failure.
    Sequential,
    /// All at once, waiting for every step regardless of failures.
    Parallel,
}

/// A named unit of work in a [`Timeline`].
pub struct Step {
    name: String,
    run: Option<StepFn>,
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("run", &self.run.is_some())
            .finish()
    }
}

impl Step {
    /// Creates a step without a function. Running it fails with [`StepFailure::Invalid`].
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            run: None,
        }
    }

    /// Creates a step running `f`.
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(Events) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::named(name).run(f)
    }

    /// Sets the function of this step.
    pub fn run<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce(Events) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.run = Some(Box::new(move |events| f(events).boxed()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn execute(self, events: Events) -> Result<(), StepFailure> {
        let Some(run) = self.run else {
            events.error("invalid_step", format!("step `{}` has no function", self.name));
            return Err(StepFailure::Invalid);
        };

        let future = match panic::catch_unwind(AssertUnwindSafe(|| run(events))) {
            Ok(future) => future,
            Err(payload) => return Err(StepFailure::Panicked(panic_message(payload.as_ref()))),
        };

        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(StepFailure::Failed(err)),
            Err(payload) => Err(StepFailure::Panicked(panic_message(payload.as_ref()))),
        }
    }
}

/// Why a single step failed.
#[derive(Debug, Error)]
pub enum StepFailure {
    /// The step has no function to run.
    #[error("step or step function is missing")]
    Invalid,
    /// The step returned an error.
    #[error(transparent)]
    Failed(anyhow::Error),
    /// The step panicked.
    #[error("step panicked: {0}")]
    Panicked(String),
    /// The step was aborted before it completed.
    #[error("step was cancelled")]
    Cancelled,
}

/// A failed step and the reason it failed.
#[derive(Debug)]
pub struct FailedStep {
    pub name: String,
    pub failure: StepFailure,
}

impl fmt::Display for FailedStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:#}", self.name, self.failure)
    }
}

/// Errors returned by [`Timeline::run`].
#[derive(Debug, Error)]
pub enum TimelineError {
    /// A step of a sequential timeline failed. Later steps were not run.
    #[error("step `{name}` failed")]
    Step {
        name: String,
        #[source]
        failure: StepFailure,
    },

    /// One or more steps of a parallel timeline failed.
    #[error("one or more parallel steps failed: [{}]", DisplayFailures(.0))]
    Parallel(Vec<FailedStep>),
}

impl TimelineError {
    /// Returns the names of all failed steps.
    pub fn failed_steps(&self) -> Vec<&str> {
        match self {
            TimelineError::Step { name, .. } => vec![name.as_str()],
            TimelineError::Parallel(failures) => {
                failures.iter().map(|failed| failed.name.as_str()).collect()
            }
        }
    }
}

struct DisplayFailures<'a>(&'a [FailedStep]);

impl fmt::Display for DisplayFailures<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failed) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{failed}")?;
        }
        Ok(())
    }
}

/// An ordered list of steps, run once in sequential or parallel mode.
#[derive(Debug)]
pub struct Timeline {
    description: String,
    mode: RunMode,
    steps: Vec<Step>,
}

impl Timeline {
    pub fn new(description: impl Into<String>, mode: RunMode) -> Self {
        Self {
            description: description.into(),
            mode,
            steps: Vec::new(),
        }
    }

    /// Appends a step running `f`.
    pub fn step<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(Events) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.push(Step::new(name, f));
        self
    }

    /// Appends a prepared step.
    pub fn push(&mut self, step: Step) {
        self.steps.push(step);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Runs all steps, bracketed by `start_timeline` and `finish_timeline` (or
    /// `timeline_failed`) events.
    pub async fn run(self, events: &Events) -> Result<(), TimelineError> {
        events.info("start_timeline", &self.description);

        let description = self.description;
        let result = match self.mode {
            RunMode::Sequential => run_sequential(self.steps, events).await,
            RunMode::Parallel => run_parallel(self.steps, events).await,
        };

        match &result {
            Ok(()) => events.info("finish_timeline", description),
            Err(err) => events.error("timeline_failed", format!("{description}: {err}")),
        }

        result
    }
}

async fn run_sequential(steps: Vec<Step>, events: &Events) -> Result<(), TimelineError> {
    for step in steps {
        let name = step.name.clone();
        step.execute(events.clone())
            .await
            .map_err(|failure| TimelineError::Step { name, failure })?;
    }
    Ok(())
}

async fn run_parallel(steps: Vec<Step>, events: &Events) -> Result<(), TimelineError> {
    let mut tasks = JoinSet::new();
    let mut spawned = HashMap::with_capacity(steps.len());
    for (index, step) in steps.into_iter().enumerate() {
        let name = step.name.clone();
        let events = events.clone();
        let handle = tasks.spawn(async move { step.execute(events).await });
        spawned.insert(handle.id(), (index, name));
    }

    let mut failures = Vec::new();
    while let Some(joined) = tasks.join_next_with_id().await {
        let (id, result) = match joined {
            Ok((id, result)) => (id, result),
            Err(err) => (err.id(), Err(join_failure(err))),
        };
        let Some((index, name)) = spawned.remove(&id) else {
            continue;
        };

        if let Err(failure) = result {
            events.error(
                "parallel_timeline_step_failed",
                format!("{name}: {failure:#}"),
            );
            failures.push((index, FailedStep { name, failure }));
        }
    }

    if failures.is_empty() {
        return Ok(());
    }

    failures.sort_by_key(|(index, _)| *index);
    Err(TimelineError::Parallel(
        failures.into_iter().map(|(_, failed)| failed).collect(),
    ))
}

/// Maps a step task that did not complete to the failure of its step.
fn join_failure(err: JoinError) -> StepFailure {
    if err.is_panic() {
        StepFailure::Panicked(panic_message(err.into_panic().as_ref()))
    } else {
        StepFailure::Cancelled
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use anyhow::anyhow;

    use crate::events::MemorySink;

    use super::*;

    fn counting_step(
        counter: &Arc<AtomicUsize>,
        fail: Option<&'static str>,
    ) -> impl FnOnce(Events) -> BoxFuture<'static, anyhow::Result<()>> + Send + 'static {
        let counter = Arc::clone(counter);
        move |_events| {
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                match fail {
                    Some(message) => Err(anyhow!(message)),
                    None => Ok(()),
                }
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn sequential_stops_at_first_failure() {
        let sink = MemorySink::new();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        let c = Arc::new(AtomicUsize::new(0));

        let err = Timeline::new("sequential", RunMode::Sequential)
            .step("A", counting_step(&a, None))
            .step("B", counting_step(&b, Some("B broke")))
            .step("C", counting_step(&c, None))
            .run(&sink.events())
            .await
            .unwrap_err();

        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
        assert_eq!(c.load(Ordering::SeqCst), 0);

        let TimelineError::Step { name, failure } = &err else {
            panic!("expected a step error, got {err:?}");
        };
        assert_eq!(name, "B");
        assert_eq!(failure.to_string(), "B broke");

        assert_eq!(sink.of_kind("start_timeline").len(), 1);
        assert_eq!(sink.of_kind("timeline_failed").len(), 1);
        assert!(sink.of_kind("finish_timeline").is_empty());
    }

    #[tokio::test]
    async fn parallel_runs_all_and_aggregates() {
        let sink = MemorySink::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let err = Timeline::new("parallel", RunMode::Parallel)
            .step("A", counting_step(&counter, Some("A broke")))
            .step("B", counting_step(&counter, None))
            .step("C", counting_step(&counter, Some("C broke")))
            .run(&sink.events())
            .await
            .unwrap_err();

        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(err.failed_steps(), ["A", "C"]);

        let message = err.to_string();
        assert!(message.contains("A broke"), "{message}");
        assert!(message.contains("C broke"), "{message}");
        assert_eq!(sink.of_kind("parallel_timeline_step_failed").len(), 2);
    }

    #[tokio::test]
    async fn parallel_steps_run_concurrently() {
        let sink = MemorySink::new();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut timeline = Timeline::new("concurrent", RunMode::Parallel);
        for i in 0..4 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            timeline.push(Step::new(format!("step-{i}"), move |_| async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                anyhow::Ok(())
            }));
        }

        timeline.run(&sink.events()).await.unwrap();
        assert!(peak.load(Ordering::SeqCst) > 1);
        assert_eq!(sink.of_kind("finish_timeline").len(), 1);
    }

    #[tokio::test]
    async fn reports_invalid_steps() {
        let sink = MemorySink::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let mut timeline = Timeline::new("invalid", RunMode::Sequential);
        timeline.push(Step::named("empty"));
        timeline.push(Step::new("never", counting_step(&counter, None)));

        let err = timeline.run(&sink.events()).await.unwrap_err();
        assert!(matches!(
            err,
            TimelineError::Step {
                failure: StepFailure::Invalid,
                ..
            }
        ));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(sink.of_kind("invalid_step").len(), 1);
    }

    #[tokio::test]
    async fn isolates_panicking_steps() {
        let sink = MemorySink::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let err = Timeline::new("panics", RunMode::Parallel)
            .step("boom", |_| async {
                if true {
                    panic!("kaboom");
                }
                anyhow::Ok(())
            })
            .step("fine", counting_step(&counter, None))
            .run(&sink.events())
            .await
            .unwrap_err();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        let TimelineError::Parallel(failures) = &err else {
            panic!("expected parallel error");
        };
        assert_eq!(failures.len(), 1);
        assert!(matches!(&failures[0].failure, StepFailure::Panicked(msg) if msg == "kaboom"));
    }

    fn panics_before_running(_events: Events) -> BoxFuture<'static, anyhow::Result<()>> {
        panic!("no future for you")
    }

    #[tokio::test]
    async fn parallel_records_steps_panicking_before_their_future() {
        let sink = MemorySink::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let err = Timeline::new("eager panic", RunMode::Parallel)
            .step("boom", panics_before_running)
            .step("fine", counting_step(&counter, None))
            .run(&sink.events())
            .await
            .unwrap_err();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(err.failed_steps(), ["boom"]);
        let TimelineError::Parallel(failures) = &err else {
            panic!("expected parallel error");
        };
        assert!(
            matches!(&failures[0].failure, StepFailure::Panicked(msg) if msg == "no future for you")
        );
        assert!(sink.of_kind("finish_timeline").is_empty());
        assert_eq!(sink.of_kind("timeline_failed").len(), 1);
    }

    #[tokio::test]
    async fn sequential_contains_steps_panicking_before_their_future() {
        let sink = MemorySink::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let err = Timeline::new("eager panic", RunMode::Sequential)
            .step("boom", panics_before_running)
            .step("never", counting_step(&counter, None))
            .run(&sink.events())
            .await
            .unwrap_err();

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(matches!(
            err,
            TimelineError::Step {
                failure: StepFailure::Panicked(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn empty_timeline_succeeds() {
        let sink = MemorySink::new();
        Timeline::new("nothing", RunMode::Parallel)
            .run(&sink.events())
            .await
            .unwrap();
        assert_eq!(sink.of_kind("finish_timeline").len(), 1);
    }
}

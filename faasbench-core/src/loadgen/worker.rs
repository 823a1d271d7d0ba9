use crossbeam_channel::Receiver;

use crate::events::Events;
use crate::loadgen::task::{RetryPolicy, Task};

/// Pulls tasks from the shared queue until it is drained.
#[derive(Debug)]
pub struct Worker {
    pub id: usize,
    pub queue: Receiver<Task>,
    pub client: reqwest::Client,
    pub retry: RetryPolicy,
    pub events: Events,
}

impl Worker {
    /// Executes tasks one at a time. Returns the number of tasks this worker dequeued.
    ///
    /// The queue is sealed before workers start, so an empty queue means all work is taken.
    pub async fn run(self) -> usize {
        let mut handled = 0;

        while let Ok(task) = self.queue.try_recv() {
            handled += 1;
            if let Err(err) = task.execute(&self.client, &self.retry).await {
                self.events.error(
                    "task_execution",
                    format!(
                        "({}: {}) Error in task execution: {err}",
                        task.function.provider, task.function.region
                    ),
                );
            }
        }

        tracing::debug!(worker = self.id, handled, "worker finished");
        handled
    }
}

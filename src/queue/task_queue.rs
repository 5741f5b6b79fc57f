/*!
 * Priority task queue with bounded concurrency and exponential-backoff retry.
 *
 * A queue owns its pending list, its in-flight set and the tasks waiting out
 * a retry delay. A single drain loop per queue admits tasks in priority
 * order; each admitted task runs in its own tokio task while holding one
 * permit of a semaphore sized to the configured concurrency, so up to
 * `concurrency` tasks await external work at the same time.
 *
 * Ordering:
 * - higher priority first, FIFO among equal priorities;
 * - a retried task keeps its priority and re-enters ahead of the pending
 *   tasks of that same priority.
 *
 * A task is attempted at most `max_retries + 1` times. The n-th retry waits
 * `retry_delay * 2^(n-1)`. Completed and exhausted tasks are discarded;
 * only the counters remember them.
 */

use anyhow::anyhow;
use async_trait::async_trait;
use futures::FutureExt;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::task::{Task, TaskId, TaskStatus};
use crate::errors::QueueError;

/// Work executed for every task of a queue
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    /// Run one attempt. Any error counts as a retryable failure.
    async fn process(&self, task: &Task) -> anyhow::Result<()>;
}

/// Static settings of a queue
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Name used in logs
    pub name: String,
    /// Maximum number of tasks processed at the same time
    pub concurrency: usize,
    /// Re-attempts allowed after the first failure
    pub max_retries: u32,
    /// Base backoff delay
    pub retry_delay: Duration,
}

impl QueueConfig {
    pub fn new(
        name: impl Into<String>,
        concurrency: usize,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            concurrency: concurrency.max(1),
            max_retries,
            retry_delay,
        }
    }
}

/// Point-in-time counters of a queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Waiting for a worker, including tasks waiting out a retry delay
    pub pending: usize,
    pub processing: usize,
    pub completed: u64,
    pub failed: u64,
}

impl std::fmt::Display for QueueStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "pending: {}, processing: {}, completed: {}, failed: {}",
            self.pending, self.processing, self.completed, self.failed
        )
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Task>,
    in_flight: HashMap<TaskId, Task>,
    awaiting_retry: HashMap<TaskId, Task>,
    completed: u64,
    failed: u64,
    draining: bool,
}

struct QueueInner {
    config: QueueConfig,
    state: Mutex<QueueState>,
    processor: OnceLock<Arc<dyn TaskProcessor>>,
    workers: Arc<Semaphore>,
}

/// Cloneable handle to a queue. Clones share the same queue.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    pub fn new(config: QueueConfig) -> Self {
        let workers = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            inner: Arc::new(QueueInner {
                config,
                state: Mutex::new(QueueState::default()),
                processor: OnceLock::new(),
                workers,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Install the processor. Tasks added before this start draining now.
    pub fn set_processor(&self, processor: Arc<dyn TaskProcessor>) -> Result<(), QueueError> {
        self.inner
            .processor
            .set(processor)
            .map_err(|_| QueueError::ProcessorAlreadySet {
                queue: self.inner.config.name.clone(),
            })?;
        debug!("[{}] Processor set", self.name());
        self.kick();
        Ok(())
    }

    /// Enqueue with the default priority 0
    pub fn add_task(&self, task_type: impl Into<String>, payload: serde_json::Value) -> Task {
        self.add_task_with_priority(task_type, payload, 0)
    }

    /// Enqueue a new task and start draining if the queue was idle.
    ///
    /// Must be called from within a tokio runtime.
    pub fn add_task_with_priority(
        &self,
        task_type: impl Into<String>,
        payload: serde_json::Value,
        priority: i32,
    ) -> Task {
        let task = Task::new(task_type, payload, priority, self.inner.config.max_retries);
        {
            let mut state = self.inner.state.lock();
            let index = state.pending.partition_point(|t| t.priority >= priority);
            state.pending.insert(index, task.clone());
            info!(
                "[{}] Added task {} ({}, priority {}), {} pending",
                self.name(),
                task.id,
                task.task_type,
                task.priority,
                state.pending.len()
            );
        }
        self.kick();
        task
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.inner.state.lock();
        QueueStats {
            pending: state.pending.len() + state.awaiting_retry.len(),
            processing: state.in_flight.len(),
            completed: state.completed,
            failed: state.failed,
        }
    }

    /// Look up a task that is still pending, waiting to retry or in flight.
    ///
    /// Completed and exhausted tasks are gone; use [`TaskQueue::stats`] to
    /// observe them.
    pub fn task_status(&self, id: TaskId) -> Option<Task> {
        let state = self.inner.state.lock();
        Self::find(&state, id)
    }

    pub fn tasks_status(&self, ids: &[TaskId]) -> HashMap<TaskId, Option<Task>> {
        let state = self.inner.state.lock();
        ids.iter().map(|id| (*id, Self::find(&state, *id))).collect()
    }

    /// No task pending, waiting to retry or in flight
    pub fn is_idle(&self) -> bool {
        let state = self.inner.state.lock();
        state.pending.is_empty() && state.in_flight.is_empty() && state.awaiting_retry.is_empty()
    }

    /// Poll until the queue is idle
    pub async fn wait_idle(&self, poll_interval: Duration) {
        while !self.is_idle() {
            tokio::time::sleep(poll_interval).await;
        }
    }

    fn find(state: &QueueState, id: TaskId) -> Option<Task> {
        state
            .in_flight
            .get(&id)
            .or_else(|| state.awaiting_retry.get(&id))
            .or_else(|| state.pending.iter().find(|t| t.id == id))
            .cloned()
    }

    /// Start the drain loop unless it already runs or there is nothing to do
    fn kick(&self) {
        if self.inner.processor.get().is_none() {
            return;
        }
        {
            let mut state = self.inner.state.lock();
            if state.draining || state.pending.is_empty() {
                return;
            }
            state.draining = true;
        }
        let queue = self.clone();
        tokio::spawn(async move { queue.drain().await });
    }

    async fn drain(self) {
        debug!("[{}] Drain loop started", self.name());
        loop {
            let permit = match self.inner.workers.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    self.inner.state.lock().draining = false;
                    return;
                }
            };

            let task = {
                let mut state = self.inner.state.lock();
                match state.pending.pop_front() {
                    Some(mut task) => {
                        task.set_status(TaskStatus::Processing);
                        state.in_flight.insert(task.id, task.clone());
                        task
                    }
                    None => {
                        state.draining = false;
                        debug!("[{}] Drain loop finished", self.name());
                        return;
                    }
                }
            };

            let queue = self.clone();
            tokio::spawn(async move { queue.execute(task, permit).await });
        }
    }

    async fn execute(self, task: Task, permit: OwnedSemaphorePermit) {
        let result = match self.inner.processor.get().cloned() {
            Some(processor) => {
                info!(
                    "[{}] Processing task {} ({}), attempt {}/{}",
                    self.name(),
                    task.id,
                    task.task_type,
                    task.retries + 1,
                    task.max_retries + 1
                );
                AssertUnwindSafe(processor.process(&task))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(anyhow!("processor panicked")))
            }
            None => Err(anyhow!("no processor set")),
        };

        let retry = self.finish(task.id, result);
        drop(permit);

        if let Some((id, delay)) = retry {
            let queue = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                queue.requeue(id);
            });
        }
    }

    /// Record the outcome of an attempt; returns the retry to schedule, if any
    fn finish(&self, id: TaskId, result: anyhow::Result<()>) -> Option<(TaskId, Duration)> {
        let mut state = self.inner.state.lock();
        let mut task = state.in_flight.remove(&id)?;

        match result {
            Ok(()) => {
                state.completed += 1;
                info!("[{}] Task {} completed", self.name(), id);
                None
            }
            Err(e) => {
                task.retries += 1;
                task.error = Some(format!("{:#}", e));
                if task.retries <= task.max_retries {
                    let delay = backoff_delay(self.inner.config.retry_delay, task.retries);
                    warn!(
                        "[{}] Task {} failed (attempt {}): {:#}; retrying in {:?}",
                        self.name(),
                        id,
                        task.retries,
                        e,
                        delay
                    );
                    task.set_status(TaskStatus::Pending);
                    state.awaiting_retry.insert(id, task);
                    Some((id, delay))
                } else {
                    task.set_status(TaskStatus::Failed);
                    state.failed += 1;
                    error!(
                        "[{}] Task {} ({}) failed permanently after {} attempt(s): {:#}",
                        self.name(),
                        id,
                        task.task_type,
                        task.retries,
                        e
                    );
                    None
                }
            }
        }
    }

    fn requeue(&self, id: TaskId) {
        {
            let mut state = self.inner.state.lock();
            let Some(task) = state.awaiting_retry.remove(&id) else {
                return;
            };
            let index = state.pending.partition_point(|t| t.priority > task.priority);
            debug!("[{}] Requeued task {} at position {}", self.name(), id, index);
            state.pending.insert(index, task);
        }
        self.kick();
    }
}

/// `base * 2^(retry - 1)` for the 1-based retry number, saturating
pub fn backoff_delay(base: Duration, retry: u32) -> Duration {
    let factor = 2u32.saturating_pow(retry.saturating_sub(1));
    base.saturating_mul(factor)
}

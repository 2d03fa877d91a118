//! Single-slot background task handles.
//!
//! A [`TaskSlot`] holds at most one in-flight unit of work. The worker writes
//! its result exactly once into a oneshot channel; the owner polls without
//! blocking (once per frame) and takes the result at most once. Starting a
//! new task while one is pending is rejected, never queued.

use std::future::Future;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// A spawned task whose result has not been consumed yet
#[derive(Debug)]
pub struct PendingTask<T> {
    result_rx: oneshot::Receiver<T>,
    join: JoinHandle<()>,
}

impl<T: Send + 'static> PendingTask<T> {
    /// Spawn `fut` on `runtime`, routing its output into the result slot
    pub fn spawn<F>(runtime: &Handle, fut: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let join = runtime.spawn(async move {
            let output = fut.await;
            // Receiver may have been dropped on shutdown
            result_tx.send(output).ok();
        });

        Self { result_rx, join }
    }
}

/// State of a polled slot
#[derive(Debug, PartialEq, Eq)]
pub enum TaskPoll<T> {
    /// Nothing was started or the result was already taken
    Idle,
    /// Still running
    Pending,
    /// Finished; result handed over and the slot is free again
    Ready(T),
}

/// At-most-one in-flight task of a given kind
#[derive(Debug)]
pub struct TaskSlot<T> {
    pending: Option<PendingTask<T>>,
    finished: Vec<JoinHandle<()>>,
}

impl<T> Default for TaskSlot<T> {
    fn default() -> Self {
        Self {
            pending: None,
            finished: Vec::new(),
        }
    }
}

impl<T: Send + 'static> TaskSlot<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a task is in flight (started and not yet consumed)
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Start `fut` unless a task is already in flight
    ///
    /// Returns `false` (and spawns nothing) when the slot is busy.
    pub fn start<F>(&mut self, runtime: &Handle, fut: F) -> bool
    where
        F: Future<Output = T> + Send + 'static,
    {
        if self.pending.is_some() {
            return false;
        }
        self.pending = Some(PendingTask::spawn(runtime, fut));
        true
    }

    /// Zero-timeout check; consumes the result once it is ready
    pub fn poll(&mut self) -> TaskPoll<T> {
        let Some(task) = self.pending.as_mut() else {
            return TaskPoll::Idle;
        };

        match task.result_rx.try_recv() {
            Ok(value) => {
                self.retire();
                TaskPoll::Ready(value)
            }
            Err(oneshot::error::TryRecvError::Empty) => TaskPoll::Pending,
            Err(oneshot::error::TryRecvError::Closed) => {
                // Worker panicked before producing a result
                tracing::error!("Background task ended without a result");
                self.retire();
                TaskPoll::Idle
            }
        }
    }

    fn retire(&mut self) {
        self.finished.retain(|join| !join.is_finished());
        if let Some(task) = self.pending.take() {
            self.finished.push(task.join);
        }
    }

    /// Convenience: `Some(result)` when ready, `None` otherwise
    pub fn take_ready(&mut self) -> Option<T> {
        match self.poll() {
            TaskPoll::Ready(value) => Some(value),
            TaskPoll::Idle | TaskPoll::Pending => None,
        }
    }

    /// Await every worker this slot ever spawned
    ///
    /// An unconsumed result is discarded.
    pub async fn join(&mut self) {
        if let Some(task) = self.pending.take() {
            if let Err(e) = task.join.await {
                tracing::error!("Background task failed during shutdown: {e}");
            }
        }
        for join in self.finished.drain(..) {
            if let Err(e) = join.await {
                tracing::error!("Background task failed during shutdown: {e}");
            }
        }
    }
}

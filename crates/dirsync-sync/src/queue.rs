//! Task queue
//!
//! Unbounded multi-consumer FIFO handing tasks from producers and checkers
//! to consumers. `put` never blocks; `take` waits until a task is available.

use async_channel::{Receiver, Sender, TrySendError};
use tracing::error;

use crate::task::Task;

#[derive(Debug)]
pub struct TaskQueue {
    tx: Sender<Task>,
    rx: Receiver<Task>,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        let (tx, rx) = async_channel::unbounded();
        Self { tx, rx }
    }

    pub fn put(&self, task: Task) {
        if let Err(TrySendError::Closed(task) | TrySendError::Full(task)) = self.tx.try_send(task) {
            error!(task = %task, "Task queue closed, dropping task");
        }
    }

    /// Removes the oldest task without waiting
    pub fn try_take(&self) -> Option<Task> {
        self.rx.try_recv().ok()
    }

    /// Removes the oldest task, waiting for one if the queue is empty
    ///
    /// A closed queue hands out poison so the taker stops.
    pub async fn take(&self) -> Task {
        match self.rx.recv().await {
            Ok(task) => task,
            Err(_) => {
                error!("Task queue closed while waiting");
                Task::poison()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Refuses further puts; queued tasks can still be taken
    pub fn close(&self) -> bool {
        self.tx.close()
    }
}

//! Consumer pool
//!
//! A fixed set of workers drains the [`TaskQueue`](crate::queue::TaskQueue). A task failure is logged
//! and counted; it never stops the worker. A worker exits when it takes a
//! poison task or when the pool is cancelled, in which case the task in
//! hand is aborted and ends `Failed`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::task::TaskContext;

/// Outcome counts over every worker of a pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub executed: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    executed: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ConsumerStats {
        ConsumerStats {
            executed: self.executed.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }
}

pub struct ConsumerPool {
    ctx: TaskContext,
    workers: Vec<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl ConsumerPool {
    /// Spawns `size` workers on the context's queue
    pub fn spawn(ctx: TaskContext, size: usize) -> Self {
        let counters = Arc::new(Counters::default());
        let workers = (0..size.max(1))
            .map(|worker| {
                let ctx = ctx.clone();
                let counters = Arc::clone(&counters);
                tokio::spawn(async move { work(worker, ctx, counters).await })
            })
            .collect();
        info!(workers = size.max(1), "Consumer pool started");
        Self {
            ctx,
            workers,
            counters,
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn stats(&self) -> ConsumerStats {
        self.counters.snapshot()
    }

    /// Interrupts every worker; running tasks are aborted
    pub fn shutdown_now(&self) {
        self.ctx.cancel.cancel();
    }

    /// Waits for every worker to exit
    pub async fn join(self) -> ConsumerStats {
        for handle in self.workers {
            if let Err(e) = handle.await {
                error!(error = %e, "Consumer worker panicked");
            }
        }
        self.counters.snapshot()
    }
}

async fn work(worker: usize, ctx: TaskContext, counters: Arc<Counters>) {
    loop {
        let mut task = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            task = ctx.queue.take() => task,
        };
        if task.is_poison() {
            debug!(worker, "Consumer took poison task");
            break;
        }

        counters.executed.fetch_add(1, Ordering::SeqCst);
        match task.execute(&ctx).await {
            Ok(()) => {
                counters.completed.fetch_add(1, Ordering::SeqCst);
                debug!(worker, task = %task, "Task completed");
            }
            Err(e) if e.is_cancelled() => {
                counters.failed.fetch_add(1, Ordering::SeqCst);
                debug!(worker, task = %task, "Task cancelled");
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::SeqCst);
                warn!(worker, task = %task, error = %e, "Task failed");
            }
        }
    }
    debug!(worker, "Consumer stopped");
}

//! # Worker Pool
//!
//! Drains the [`PipeQueue`] with a fixed number of concurrent workers.
//!
//! ## Overview
//!
//! Two independent loops run until cancelled, each sleeping a jittered
//! interval between iterations:
//!
//! - **auto-enqueue**: schedules every automatic pipe
//! - **drain**: spawns `workers` worker tasks and waits for all of them
//!
//! A worker dequeues batches and runs each pipe under its workspace lock,
//! then marks it synchronized. After `idle_retries` empty dequeues in a row
//! it returns, which ends the drain cycle once every worker is idle.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let pool = Arc::new(WorkerPool::new(settings, queue, synchronizer, locks, reporter));
//! let handle = pool.start();
//! // ...
//! handle.shutdown().await;
//! ```

use bridge_traits::report::{ErrorReport, ErrorReporter};
use core_runtime::config::{JitteredInterval, PipesConfig};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::locks::WorkspaceLocks;
use crate::pipe::Pipe;
use crate::queue::PipeQueue;
use crate::synchronizer::PipeSynchronizer;

/// Timing and sizing of the pool.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolSettings {
    pub workers: usize,
    pub auto_enqueue_interval: JitteredInterval,
    pub drain_interval: JitteredInterval,
    pub idle_backoff: JitteredInterval,
    pub idle_retries: u32,
}

impl From<&PipesConfig> for WorkerPoolSettings {
    fn from(config: &PipesConfig) -> Self {
        Self {
            workers: config.workers,
            auto_enqueue_interval: config.auto_enqueue_interval,
            drain_interval: config.drain_interval,
            idle_backoff: config.idle_backoff,
            idle_retries: config.idle_retries,
        }
    }
}

pub struct WorkerPool {
    settings: WorkerPoolSettings,
    queue: Arc<dyn PipeQueue>,
    synchronizer: Arc<dyn PipeSynchronizer>,
    locks: Arc<WorkspaceLocks>,
    reporter: Arc<dyn ErrorReporter>,
}

/// Running loops of a started pool.
pub struct WorkerPoolHandle {
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

impl WorkerPoolHandle {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop both loops. An in-flight drain cycle finishes its runs first.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker pool loop panicked");
            }
        }
        info!("Worker pool stopped");
    }
}

impl WorkerPool {
    pub fn new(
        settings: WorkerPoolSettings,
        queue: Arc<dyn PipeQueue>,
        synchronizer: Arc<dyn PipeSynchronizer>,
        locks: Arc<WorkspaceLocks>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        Self {
            settings,
            queue,
            synchronizer,
            locks,
            reporter,
        }
    }

    /// Spawn the auto-enqueue and drain loops.
    pub fn start(self: &Arc<Self>) -> WorkerPoolHandle {
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();

        let pool = self.clone();
        let token = cancel.clone();
        tasks.spawn(async move { pool.run_auto_enqueue_loop(token).await });

        let pool = self.clone();
        let token = cancel.clone();
        tasks.spawn(async move { pool.run_drain_loop(token).await });

        info!(workers = self.settings.workers, "Worker pool started");
        WorkerPoolHandle { cancel, tasks }
    }

    pub async fn run_auto_enqueue_loop(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.auto_enqueue_interval.sample()) => {}
            }

            match self.queue.schedule_automatic_pipes_synchronization().await {
                Ok(count) => debug!(count, "Auto-enqueue sweep finished"),
                Err(e) if e.is_duplicate_entry() => debug!("Auto-enqueue raced another scheduler"),
                Err(e) => {
                    error!(error = %e, "Auto-enqueue sweep failed");
                    self.reporter
                        .report(ErrorReport::new("schedule_automatic_pipes", e.to_string()));
                }
            }
        }
        debug!("Auto-enqueue loop stopped");
    }

    pub async fn run_drain_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.drain_interval.sample()) => {}
            }

            let processed = self.drain_once(&cancel).await;
            if processed > 0 {
                info!(processed, "Drain cycle finished");
            }
        }
        debug!("Drain loop stopped");
    }

    /// One drain cycle: run `workers` workers until all are idle.
    ///
    /// Returns the number of pipes synchronized.
    #[instrument(skip(self, cancel))]
    pub async fn drain_once(self: &Arc<Self>, cancel: &CancellationToken) -> usize {
        let mut workers = JoinSet::new();
        for worker_id in 0..self.settings.workers {
            let pool = self.clone();
            let cancel = cancel.clone();
            workers.spawn(async move { pool.work(worker_id, cancel).await });
        }

        let mut processed = 0;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(count) => processed += count,
                Err(e) => error!(error = %e, "Worker task panicked"),
            }
        }
        processed
    }

    async fn work(&self, worker_id: usize, cancel: CancellationToken) -> usize {
        let mut processed = 0;
        let mut idle = 0;

        while !cancel.is_cancelled() {
            let batch = match self.queue.load_scheduled_pipes().await {
                Ok(batch) => batch,
                Err(e) => {
                    error!(worker_id, error = %e, "Failed to load scheduled pipes");
                    self.reporter
                        .report(ErrorReport::new("load_scheduled_pipes", e.to_string()));
                    Vec::new()
                }
            };

            if batch.is_empty() {
                if idle >= self.settings.idle_retries {
                    break;
                }
                idle += 1;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.settings.idle_backoff.sample()) => {}
                }
                continue;
            }

            idle = 0;
            for pipe in batch {
                self.run_pipe(worker_id, &pipe).await;
                processed += 1;
            }
        }

        debug!(worker_id, processed, "Worker finished");
        processed
    }

    async fn run_pipe(&self, worker_id: usize, pipe: &Pipe) {
        {
            let _guard = self.locks.acquire(pipe.workspace_id).await;
            let status = self.synchronizer.synchronize(pipe).await;
            debug!(
                worker_id,
                workspace_id = pipe.workspace_id,
                key = %pipe.key(),
                state = %status.state,
                "Pipe run finished"
            );
        }

        if let Err(e) = self.queue.mark_pipe_synchronized(pipe).await {
            warn!(
                worker_id,
                workspace_id = pipe.workspace_id,
                key = %pipe.key(),
                error = %e,
                "Failed to mark pipe synchronized"
            );
            self.reporter.report(
                ErrorReport::new("mark_pipe_synchronized", e.to_string())
                    .with_workspace(pipe.workspace_id)
                    .with_service(pipe.service_id.clone())
                    .with_pipe(pipe.pipe_type.as_str()),
            );
        }
    }
}

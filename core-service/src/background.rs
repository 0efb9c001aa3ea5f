//! # Background Runner
//!
//! Bounded fire-and-forget execution for work that outlives a request:
//! snapshot imports after a cache miss and on-demand users runs.
//!
//! ## Overview
//!
//! - At most `capacity` tasks run at once; [`BackgroundRunner::submit`] fails
//!   fast with [`ServiceError::BackgroundCapacity`] instead of queueing
//! - A failing task is logged and forwarded to the error sink
//! - [`BackgroundRunner::shutdown`] rejects new work, cancels tasks still
//!   waiting on [`BackgroundRunner::cancellation_token`] and joins the rest

use bridge_traits::report::{ErrorReport, ErrorReporter};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, ServiceError};

pub struct BackgroundRunner {
    capacity: usize,
    permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
    cancel: CancellationToken,
    reporter: Arc<dyn ErrorReporter>,
}

impl BackgroundRunner {
    pub fn new(capacity: usize, reporter: Arc<dyn ErrorReporter>) -> Self {
        Self {
            capacity,
            permits: Arc::new(Semaphore::new(capacity)),
            tasks: Mutex::new(JoinSet::new()),
            cancel: CancellationToken::new(),
            reporter,
        }
    }

    /// Cancelled once shutdown starts. Tasks select on it while waiting.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Number of tasks currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    /// Spawn `task` if a slot is free.
    ///
    /// # Errors
    ///
    /// [`ServiceError::BackgroundCapacity`] when every slot is taken or the
    /// runner is shutting down.
    pub fn submit<F>(&self, name: &'static str, task: F) -> Result<()>
    where
        F: Future<Output = core_sync::Result<()>> + Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| ServiceError::BackgroundCapacity {
                capacity: self.capacity,
            })?;

        let reporter = self.reporter.clone();
        let mut tasks = self
            .tasks
            .lock()
            .map_err(|_| {
                ServiceError::InitializationFailed("background task set poisoned".to_string())
            })?;

        // Reap finished tasks so the set does not grow without bound.
        while let Some(joined) = tasks.try_join_next() {
            if let Err(e) = joined {
                error!(error = %e, "Background task panicked");
            }
        }

        tasks.spawn(async move {
            let _permit = permit;
            debug!(task = name, "Background task started");
            if let Err(e) = task.await {
                error!(task = name, error = %e, "Background task failed");
                reporter.report(ErrorReport::new(name, e.to_string()));
            }
        });
        Ok(())
    }

    /// Stop accepting work, cancel waiters and join everything in flight.
    pub async fn shutdown(&self) {
        self.permits.close();
        self.cancel.cancel();

        let mut tasks = match self.tasks.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => {
                warn!("Background task set poisoned, in-flight tasks are detached");
                return;
            }
        };

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Background task panicked");
            }
        }
        info!("Background runner stopped");
    }
}

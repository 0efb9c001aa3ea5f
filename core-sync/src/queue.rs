//! # Pipe Queue
//!
//! Durable, priority-ordered work queue of `(workspace, pipe)` pairs.
//!
//! ## Overview
//!
//! - The periodic sweep enqueues every automatic pipe that is not pending yet
//! - "Run now" boosts a waiting entry to high priority, or inserts one. A
//!   request for a pipe whose entry is in flight queues a follow-up run
//! - Dequeue locks a batch ordered by priority then insertion order, taking
//!   at most one entry per workspace and skipping workspaces that still have
//!   a locked entry in flight
//! - Entries locked for longer than the stale timeout are released again
//!
//! A partial unique index keeps at most one waiting (unlocked) entry per
//! pipe, so concurrent enqueuers race into ignored duplicates instead of
//! failures.

use async_trait::async_trait;
use bridge_traits::time::Clock;
use core_runtime::events::{CoreEvent, EventBus, QueueEvent};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, SyncError};
use crate::pipe::{parse_pipe_key, Pipe};
use crate::pipe_store::PipeStore;

/// Queue ordering class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Normal = 0,
    High = 1,
}

impl Priority {
    pub fn as_i64(&self) -> i64 {
        *self as i64
    }
}

#[async_trait]
pub trait PipeQueue: Send + Sync {
    /// Enqueue every automatic pipe that has no pending entry.
    ///
    /// Returns the number of entries added.
    async fn schedule_automatic_pipes_synchronization(&self) -> Result<u64>;

    /// Lock and return the next batch of due pipes, never two of one workspace.
    /// Empty when nothing is due.
    async fn load_scheduled_pipes(&self) -> Result<Vec<Pipe>>;

    /// Release the pipe's locked entry as done.
    async fn mark_pipe_synchronized(&self, pipe: &Pipe) -> Result<()>;

    /// Move the pipe to the front of the queue. When the pipe is running,
    /// it runs once more after the current run.
    async fn queue_pipe_now(&self, pipe: &Pipe) -> Result<()>;
}

pub struct SqlitePipeQueue {
    pool: SqlitePool,
    pipes: Arc<dyn PipeStore>,
    clock: Arc<dyn Clock>,
    event_bus: EventBus,
    batch_size: usize,
    stale_lock_timeout: Duration,
    dequeue_lock: Mutex<()>,
}

impl SqlitePipeQueue {
    pub fn new(
        pool: SqlitePool,
        pipes: Arc<dyn PipeStore>,
        clock: Arc<dyn Clock>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            pool,
            pipes,
            clock,
            event_bus,
            batch_size: 10,
            stale_lock_timeout: Duration::from_secs(2 * 60 * 60),
            dequeue_lock: Mutex::new(()),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_stale_lock_timeout(mut self, timeout: Duration) -> Self {
        self.stale_lock_timeout = timeout;
        self
    }

    fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    /// Lock up to `batch_size` entries and return `(id, workspace_id, key)`.
    async fn lock_batch(&self) -> Result<Vec<(i64, i64, String)>> {
        let now = self.now_millis();
        let stale_before = now - self.stale_lock_timeout.as_millis() as i64;
        let mut tx = self.pool.begin().await.map_err(SyncError::from_sqlx)?;

        // A stale entry with a follow-up already waiting is closed instead.
        sqlx::query(
            r#"
            UPDATE queued_pipes SET synced_at = ?
            WHERE synced_at IS NULL AND locked_at IS NOT NULL AND locked_at < ?
              AND EXISTS (
                  SELECT 1 FROM queued_pipes AS w
                  WHERE w.workspace_id = queued_pipes.workspace_id
                    AND w.key = queued_pipes.key
                    AND w.synced_at IS NULL
                    AND w.locked_at IS NULL
              )
            "#,
        )
        .bind(now)
        .bind(stale_before)
        .execute(&mut *tx)
        .await
        .map_err(SyncError::from_sqlx)?;

        let released = sqlx::query(
            r#"
            UPDATE queued_pipes SET locked_at = NULL
            WHERE synced_at IS NULL AND locked_at IS NOT NULL AND locked_at < ?
            "#,
        )
        .bind(stale_before)
        .execute(&mut *tx)
        .await
        .map_err(SyncError::from_sqlx)?
        .rows_affected();

        if released > 0 {
            warn!(released, "Released stale queue locks");
        }

        let batch: Vec<(i64, i64, String)> = sqlx::query_as(
            r#"
            SELECT id, workspace_id, key FROM (
                SELECT id, workspace_id, key, priority,
                       ROW_NUMBER() OVER (
                           PARTITION BY workspace_id ORDER BY priority DESC, id
                       ) AS slot
                FROM queued_pipes AS q
                WHERE q.synced_at IS NULL
                  AND q.locked_at IS NULL
                  AND NOT EXISTS (
                      SELECT 1 FROM queued_pipes AS l
                      WHERE l.workspace_id = q.workspace_id
                        AND l.synced_at IS NULL
                        AND l.locked_at IS NOT NULL
                  )
            )
            WHERE slot = 1
            ORDER BY priority DESC, id
            LIMIT ?
            "#,
        )
        .bind(self.batch_size as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(SyncError::from_sqlx)?;

        for (id, _, _) in &batch {
            sqlx::query("UPDATE queued_pipes SET locked_at = ? WHERE id = ?")
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(SyncError::from_sqlx)?;
        }

        tx.commit().await.map_err(SyncError::from_sqlx)?;
        Ok(batch)
    }

    async fn mark_entry_synced(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE queued_pipes SET synced_at = ? WHERE id = ?")
            .bind(self.now_millis())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(SyncError::from_sqlx)?;
        Ok(())
    }
}

#[async_trait]
impl PipeQueue for SqlitePipeQueue {
    #[instrument(skip(self))]
    async fn schedule_automatic_pipes_synchronization(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO queued_pipes (workspace_id, key, priority, created_at)
            SELECT p.workspace_id, p.key, ?, ? FROM pipes AS p
            WHERE p.automatic = 1
              AND NOT EXISTS (
                  SELECT 1 FROM queued_pipes AS q
                  WHERE q.workspace_id = p.workspace_id AND q.key = p.key AND q.synced_at IS NULL
              )
            ORDER BY p.workspace_id, p.key
            "#,
        )
        .bind(Priority::Normal.as_i64())
        .bind(self.now_millis())
        .execute(&self.pool)
        .await
        .map_err(SyncError::from_sqlx);

        let count = match result {
            Ok(done) => done.rows_affected(),
            Err(e) if e.is_duplicate_entry() => {
                debug!("Another scheduler enqueued the same pipes");
                0
            }
            Err(e) => return Err(e),
        };

        if count > 0 {
            info!(count, "Scheduled automatic pipes");
            let _ = self
                .event_bus
                .emit(CoreEvent::Queue(QueueEvent::Scheduled { count }));
        }
        Ok(count)
    }

    #[instrument(skip(self))]
    async fn load_scheduled_pipes(&self) -> Result<Vec<Pipe>> {
        let _guard = self.dequeue_lock.lock().await;
        let batch = self.lock_batch().await?;
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipes = Vec::with_capacity(batch.len());
        for (id, workspace_id, key) in batch {
            let loaded = match parse_pipe_key(&key) {
                Ok((service_id, pipe_type)) => {
                    self.pipes.load(workspace_id, &service_id, pipe_type).await?
                }
                Err(e) => {
                    warn!(workspace_id, key = %key, error = %e, "Dropping malformed queue entry");
                    None
                }
            };

            match loaded {
                Some(pipe) => pipes.push(pipe),
                None => {
                    debug!(workspace_id, key = %key, "Pipe no longer exists, releasing entry");
                    self.mark_entry_synced(id).await?;
                }
            }
        }

        debug!(count = pipes.len(), "Locked queue batch");
        let _ = self
            .event_bus
            .emit(CoreEvent::Queue(QueueEvent::Dequeued { count: pipes.len() }));
        Ok(pipes)
    }

    async fn mark_pipe_synchronized(&self, pipe: &Pipe) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE queued_pipes SET synced_at = ?
            WHERE workspace_id = ? AND key = ? AND synced_at IS NULL AND locked_at IS NOT NULL
            "#,
        )
        .bind(self.now_millis())
        .bind(pipe.workspace_id)
        .bind(pipe.key())
        .execute(&self.pool)
        .await
        .map_err(SyncError::from_sqlx)?;

        Ok(())
    }

    #[instrument(skip(self, pipe), fields(workspace_id = pipe.workspace_id, key = %pipe.key()))]
    async fn queue_pipe_now(&self, pipe: &Pipe) -> Result<()> {
        let boosted = sqlx::query(
            r#"
            UPDATE queued_pipes SET priority = ?
            WHERE workspace_id = ? AND key = ? AND synced_at IS NULL AND locked_at IS NULL
            "#,
        )
        .bind(Priority::High.as_i64())
        .bind(pipe.workspace_id)
        .bind(pipe.key())
        .execute(&self.pool)
        .await
        .map_err(SyncError::from_sqlx)?
        .rows_affected();

        if boosted == 0 {
            let inserted = sqlx::query(
                r#"
                INSERT INTO queued_pipes (workspace_id, key, priority, created_at)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(pipe.workspace_id)
            .bind(pipe.key())
            .bind(Priority::High.as_i64())
            .bind(self.now_millis())
            .execute(&self.pool)
            .await
            .map_err(SyncError::from_sqlx);

            match inserted {
                Ok(_) => {}
                Err(e) if e.is_duplicate_entry() => debug!("Pipe was enqueued concurrently"),
                Err(e) => return Err(e),
            }
        }

        let _ = self.event_bus.emit(CoreEvent::Queue(QueueEvent::Boosted {
            workspace_id: pipe.workspace_id,
            service_id: pipe.service_id.clone(),
            pipe_id: pipe.pipe_type.as_str().to_string(),
        }));
        Ok(())
    }
}

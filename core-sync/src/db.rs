//! # Storage
//!
//! SQLite pool shared by the pipe, status, mapping, import and queue stores.
//!
//! ## Overview
//!
//! File databases run in WAL mode so status reads do not wait on the queue
//! writer. The schema lives in `migrations/` and is applied every time a pool
//! is opened. Authorizations are owned by `core-auth`, which creates its own
//! table on the same pool.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};

const MEMORY_URL: &str = "sqlite::memory:";

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    /// How long a statement waits on a locked database before failing.
    pub busy_timeout: Duration,
    pub acquire_timeout: Duration,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 8,
            busy_timeout: Duration::from_secs(10),
            acquire_timeout: Duration::from_secs(30),
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max.max(1);
        self
    }

    /// Every in-memory connection sees its own empty database, so memory
    /// pools are capped at one connection.
    fn pool_size(&self) -> u32 {
        if self.url.contains(":memory:") {
            1
        } else {
            self.max_connections
        }
    }
}

/// Open the pool, migrate, and probe it once.
///
/// # Errors
///
/// [`SyncError::PersistenceFailed`] when any of the three steps fails.
pub async fn create_pool(config: DatabaseConfig) -> Result<SqlitePool> {
    let pool_size = config.pool_size();
    let mut options = SqliteConnectOptions::from_str(&config.url)
        .map_err(SyncError::from_sqlx)?
        .create_if_missing(true)
        .foreign_keys(true)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(config.busy_timeout);
    if pool_size > 1 {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(pool_size)
        .acquire_timeout(config.acquire_timeout)
        .connect_with(options)
        .await
        .map_err(|e| {
            warn!(url = %config.url, error = %e, "Cannot open database");
            SyncError::from_sqlx(e)
        })?;

    run_migrations(&pool).await?;
    health_check(&pool).await?;

    info!(url = %config.url, pool_size, "Database ready");
    Ok(pool)
}

pub async fn create_test_pool() -> Result<SqlitePool> {
    create_pool(DatabaseConfig::new(MEMORY_URL)).await
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| SyncError::PersistenceFailed(format!("migration failed: {}", e)))?;
    debug!("Schema up to date");
    Ok(())
}

/// `SELECT 1` round trip, used by readiness reporting.
pub async fn health_check(pool: &SqlitePool) -> Result<()> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .map(|_| ())
        .map_err(SyncError::from_sqlx)
}

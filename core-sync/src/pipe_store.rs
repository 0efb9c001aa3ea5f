//! # Pipe Store
//!
//! Persistence for pipe configuration and the latest run status per pipe.

use async_trait::async_trait;
use bridge_traits::time::{Clock, SystemClock};
use chrono::{DateTime, Utc};
use core_auth::WorkspaceId;
use sqlx::{FromRow, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::pipe::{pipe_key, Pipe, PipeType};
use crate::status::Status;

#[async_trait]
pub trait PipeStore: Send + Sync {
    async fn load(
        &self,
        workspace_id: WorkspaceId,
        service_id: &str,
        pipe_type: PipeType,
    ) -> Result<Option<Pipe>>;

    /// Insert or update a pipe. Saving always marks the pipe configured.
    async fn save(&self, pipe: &Pipe) -> Result<()>;

    /// Remove a pipe together with its status.
    async fn delete(
        &self,
        workspace_id: WorkspaceId,
        service_id: &str,
        pipe_type: PipeType,
    ) -> Result<()>;

    async fn load_all(&self, workspace_id: WorkspaceId) -> Result<Vec<Pipe>>;

    async fn load_last_sync_for(&self, pipe: &Pipe) -> Result<Option<DateTime<Utc>>>;

    /// Set only `last_sync` of a stored pipe, leaving its settings alone.
    ///
    /// Returns `false` when the pipe no longer exists; nothing is written then.
    async fn update_last_sync(
        &self,
        workspace_id: WorkspaceId,
        service_id: &str,
        pipe_type: PipeType,
        last_sync: DateTime<Utc>,
    ) -> Result<bool>;

    async fn load_status(
        &self,
        workspace_id: WorkspaceId,
        service_id: &str,
        pipe_type: PipeType,
    ) -> Result<Option<Status>>;

    /// Overwrite the pipe's current status.
    ///
    /// Returns `false` without writing when the pipe no longer exists.
    async fn save_status(&self, status: &Status) -> Result<bool>;

    /// Every status of a workspace keyed by pipe key.
    async fn load_all_statuses(&self, workspace_id: WorkspaceId) -> Result<HashMap<String, Status>>;

    /// Cascade used when a service is disconnected.
    async fn delete_by_workspace_and_service(
        &self,
        workspace_id: WorkspaceId,
        service_id: &str,
    ) -> Result<()>;

    /// `true` when storage cannot be reached.
    async fn is_down(&self) -> bool;
}

pub struct SqlitePipeStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl SqlitePipeStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            clock: Arc::new(SystemClock),
        }
    }

    /// Clock for the `updated_at` column of statuses.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[derive(Debug, FromRow)]
struct PipeRow {
    workspace_id: i64,
    service_id: String,
    pipe_id: String,
    automatic: bool,
    configured: bool,
    service_params: String,
    last_sync_at: Option<i64>,
}

impl TryFrom<PipeRow> for Pipe {
    type Error = SyncError;

    fn try_from(row: PipeRow) -> Result<Self> {
        let pipe_type: PipeType = row.pipe_id.parse()?;
        let service_params = serde_json::from_str(&row.service_params).map_err(SyncError::json)?;

        Ok(Pipe {
            workspace_id: row.workspace_id,
            service_id: row.service_id,
            pipe_type,
            automatic: row.automatic,
            configured: row.configured,
            service_params,
            last_sync: row.last_sync_at.and_then(DateTime::<Utc>::from_timestamp_millis),
            users_selector: None,
        })
    }
}

const SELECT_PIPE: &str = r#"
    SELECT workspace_id, service_id, pipe_id, automatic, configured, service_params, last_sync_at
    FROM pipes
"#;

#[async_trait]
impl PipeStore for SqlitePipeStore {
    async fn load(
        &self,
        workspace_id: WorkspaceId,
        service_id: &str,
        pipe_type: PipeType,
    ) -> Result<Option<Pipe>> {
        let row = sqlx::query_as::<_, PipeRow>(&format!(
            "{} WHERE workspace_id = ? AND key = ?",
            SELECT_PIPE
        ))
        .bind(workspace_id)
        .bind(pipe_key(service_id, pipe_type))
        .fetch_optional(&self.pool)
        .await
        .map_err(SyncError::from_sqlx)?;

        row.map(Pipe::try_from).transpose()
    }

    async fn save(&self, pipe: &Pipe) -> Result<()> {
        let service_params = serde_json::to_string(&pipe.service_params).map_err(SyncError::json)?;

        sqlx::query(
            r#"
            INSERT INTO pipes (
                workspace_id, key, service_id, pipe_id, automatic, configured, service_params,
                last_sync_at
            )
            VALUES (?, ?, ?, ?, ?, 1, ?, ?)
            ON CONFLICT (workspace_id, key) DO UPDATE SET
                automatic = excluded.automatic,
                configured = 1,
                service_params = excluded.service_params,
                last_sync_at = excluded.last_sync_at
            "#,
        )
        .bind(pipe.workspace_id)
        .bind(pipe.key())
        .bind(&pipe.service_id)
        .bind(pipe.pipe_type.as_str())
        .bind(pipe.automatic)
        .bind(service_params)
        .bind(pipe.last_sync.map(|t| t.timestamp_millis()))
        .execute(&self.pool)
        .await
        .map_err(SyncError::from_sqlx)?;

        debug!(workspace_id = pipe.workspace_id, key = %pipe.key(), "Saved pipe");
        Ok(())
    }

    async fn delete(
        &self,
        workspace_id: WorkspaceId,
        service_id: &str,
        pipe_type: PipeType,
    ) -> Result<()> {
        let key = pipe_key(service_id, pipe_type);
        let mut tx = self.pool.begin().await.map_err(SyncError::from_sqlx)?;

        sqlx::query("DELETE FROM pipes WHERE workspace_id = ? AND key = ?")
            .bind(workspace_id)
            .bind(&key)
            .execute(&mut *tx)
            .await
            .map_err(SyncError::from_sqlx)?;

        sqlx::query("DELETE FROM pipe_statuses WHERE workspace_id = ? AND key = ?")
            .bind(workspace_id)
            .bind(&key)
            .execute(&mut *tx)
            .await
            .map_err(SyncError::from_sqlx)?;

        tx.commit().await.map_err(SyncError::from_sqlx)
    }

    async fn load_all(&self, workspace_id: WorkspaceId) -> Result<Vec<Pipe>> {
        let rows = sqlx::query_as::<_, PipeRow>(&format!(
            "{} WHERE workspace_id = ? ORDER BY key",
            SELECT_PIPE
        ))
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await
        .map_err(SyncError::from_sqlx)?;

        rows.into_iter().map(Pipe::try_from).collect()
    }

    async fn load_last_sync_for(&self, pipe: &Pipe) -> Result<Option<DateTime<Utc>>> {
        let last_sync: Option<Option<i64>> =
            sqlx::query_scalar("SELECT last_sync_at FROM pipes WHERE workspace_id = ? AND key = ?")
                .bind(pipe.workspace_id)
                .bind(pipe.key())
                .fetch_optional(&self.pool)
                .await
                .map_err(SyncError::from_sqlx)?;

        Ok(last_sync.flatten().and_then(DateTime::<Utc>::from_timestamp_millis))
    }

    async fn update_last_sync(
        &self,
        workspace_id: WorkspaceId,
        service_id: &str,
        pipe_type: PipeType,
        last_sync: DateTime<Utc>,
    ) -> Result<bool> {
        let updated =
            sqlx::query("UPDATE pipes SET last_sync_at = ? WHERE workspace_id = ? AND key = ?")
                .bind(last_sync.timestamp_millis())
                .bind(workspace_id)
                .bind(pipe_key(service_id, pipe_type))
                .execute(&self.pool)
                .await
                .map_err(SyncError::from_sqlx)?
                .rows_affected();

        Ok(updated > 0)
    }

    async fn load_status(
        &self,
        workspace_id: WorkspaceId,
        service_id: &str,
        pipe_type: PipeType,
    ) -> Result<Option<Status>> {
        let data: Option<String> =
            sqlx::query_scalar("SELECT data FROM pipe_statuses WHERE workspace_id = ? AND key = ?")
                .bind(workspace_id)
                .bind(pipe_key(service_id, pipe_type))
                .fetch_optional(&self.pool)
                .await
                .map_err(SyncError::from_sqlx)?;

        data.map(|d| serde_json::from_str(&d).map_err(SyncError::json))
            .transpose()
    }

    async fn save_status(&self, status: &Status) -> Result<bool> {
        let data = serde_json::to_string(status).map_err(SyncError::json)?;
        let key = format!("{}:{}", status.service_id, status.pipe_id);

        // The WHERE clause also keeps the SELECT apart from the upsert clause.
        let written = sqlx::query(
            r#"
            INSERT INTO pipe_statuses (workspace_id, key, data, updated_at)
            SELECT ?, ?, ?, ?
            WHERE EXISTS (SELECT 1 FROM pipes WHERE workspace_id = ? AND key = ?)
            ON CONFLICT (workspace_id, key) DO UPDATE SET
                data = excluded.data,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(status.workspace_id)
        .bind(&key)
        .bind(data)
        .bind(self.clock.now().timestamp())
        .bind(status.workspace_id)
        .bind(&key)
        .execute(&self.pool)
        .await
        .map_err(SyncError::from_sqlx)?
        .rows_affected();

        Ok(written > 0)
    }

    async fn load_all_statuses(
        &self,
        workspace_id: WorkspaceId,
    ) -> Result<HashMap<String, Status>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, data FROM pipe_statuses WHERE workspace_id = ?")
                .bind(workspace_id)
                .fetch_all(&self.pool)
                .await
                .map_err(SyncError::from_sqlx)?;

        let mut statuses = HashMap::with_capacity(rows.len());
        for (key, data) in rows {
            match serde_json::from_str(&data) {
                Ok(status) => {
                    statuses.insert(key, status);
                }
                Err(e) => warn!(workspace_id, key = %key, error = %e, "Skipping unreadable status"),
            }
        }
        Ok(statuses)
    }

    async fn delete_by_workspace_and_service(
        &self,
        workspace_id: WorkspaceId,
        service_id: &str,
    ) -> Result<()> {
        let prefix = format!("{}:", service_id);
        let mut tx = self.pool.begin().await.map_err(SyncError::from_sqlx)?;

        sqlx::query("DELETE FROM pipes WHERE workspace_id = ? AND service_id = ?")
            .bind(workspace_id)
            .bind(service_id)
            .execute(&mut *tx)
            .await
            .map_err(SyncError::from_sqlx)?;

        sqlx::query(
            "DELETE FROM pipe_statuses WHERE workspace_id = ? AND substr(key, 1, length(?)) = ?",
        )
        .bind(workspace_id)
        .bind(&prefix)
        .bind(&prefix)
        .execute(&mut *tx)
        .await
        .map_err(SyncError::from_sqlx)?;

        tx.commit().await.map_err(SyncError::from_sqlx)
    }

    async fn is_down(&self) -> bool {
        crate::db::health_check(&self.pool).await.is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;
    use chrono::TimeZone;
    use serde_json::json;

    async fn store() -> SqlitePipeStore {
        SqlitePipeStore::new(create_test_pool().await.unwrap())
    }

    fn pipe(workspace_id: WorkspaceId, service_id: &str, pipe_type: PipeType) -> Pipe {
        let mut pipe = Pipe::new(workspace_id, service_id, pipe_type);
        pipe.automatic = true;
        pipe.service_params = json!({"account_id": 42});
        pipe
    }

    #[tokio::test]
    async fn test_save_marks_configured() {
        let store = store().await;
        store.save(&pipe(1, "asana", PipeType::Projects)).await.unwrap();

        let loaded = store.load(1, "asana", PipeType::Projects).await.unwrap().unwrap();
        assert!(loaded.configured);
        assert!(loaded.automatic);
        assert_eq!(loaded.service_params, json!({"account_id": 42}));
        assert!(store.load(1, "asana", PipeType::Users).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_last_sync_round_trip() {
        let store = store().await;
        let mut p = pipe(1, "github", PipeType::Projects);
        store.save(&p).await.unwrap();
        assert_eq!(store.load_last_sync_for(&p).await.unwrap(), None);

        let at = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();
        p.last_sync = Some(at);
        store.save(&p).await.unwrap();
        assert_eq!(store.load_last_sync_for(&p).await.unwrap(), Some(at));
    }

    #[tokio::test]
    async fn test_update_last_sync_keeps_settings() {
        let store = store().await;
        let mut p = pipe(1, "github", PipeType::Tasks);
        store.save(&p).await.unwrap();

        p.automatic = false;
        p.service_params = json!({"account_id": 7});
        store.save(&p).await.unwrap();

        let at = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();
        assert!(store.update_last_sync(1, "github", PipeType::Tasks, at).await.unwrap());

        let loaded = store.load(1, "github", PipeType::Tasks).await.unwrap().unwrap();
        assert_eq!(loaded.last_sync, Some(at));
        assert!(!loaded.automatic);
        assert_eq!(loaded.service_params, json!({"account_id": 7}));
    }

    #[tokio::test]
    async fn test_update_last_sync_does_not_recreate_deleted_pipe() {
        let store = store().await;
        store.save(&pipe(1, "github", PipeType::Tasks)).await.unwrap();
        store.delete(1, "github", PipeType::Tasks).await.unwrap();

        let at = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();
        assert!(!store.update_last_sync(1, "github", PipeType::Tasks, at).await.unwrap());
        assert!(store.load(1, "github", PipeType::Tasks).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_status_round_trip_and_overwrite() {
        let store = store().await;
        store.save(&pipe(1, "asana", PipeType::Users)).await.unwrap();
        let date = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();
        let mut status =
            Status::new(1, "asana", PipeType::Users, date, "https://pipes.example.com");
        assert!(store.save_status(&status).await.unwrap());

        status.complete(crate::pipe::EntityType::Users, vec![], 4);
        assert!(store.save_status(&status).await.unwrap());

        let loaded = store.load_status(1, "asana", PipeType::Users).await.unwrap().unwrap();
        assert_eq!(loaded, status);

        let all = store.load_all_statuses(1).await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all.contains_key("asana:users"));
    }

    #[tokio::test]
    async fn test_status_needs_a_stored_pipe() {
        let store = store().await;
        let status = Status::new(1, "asana", PipeType::Projects, Utc::now(), "");

        assert!(!store.save_status(&status).await.unwrap());
        assert!(store.load_status(1, "asana", PipeType::Projects).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_status_timestamp_comes_from_clock() {
        let at = Utc.with_ymd_and_hms(2024, 5, 2, 8, 0, 0).unwrap();
        let store = store()
            .await
            .with_clock(Arc::new(bridge_traits::time::FixedClock(at)));
        store.save(&pipe(1, "asana", PipeType::Users)).await.unwrap();
        store
            .save_status(&Status::new(1, "asana", PipeType::Users, Utc::now(), ""))
            .await
            .unwrap();

        let updated_at: i64 = sqlx::query_scalar("SELECT updated_at FROM pipe_statuses")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(updated_at, at.timestamp());
    }

    #[tokio::test]
    async fn test_delete_removes_pipe_and_status() {
        let store = store().await;
        store.save(&pipe(1, "asana", PipeType::Tasks)).await.unwrap();
        let status = Status::new(1, "asana", PipeType::Tasks, Utc::now(), "");
        store.save_status(&status).await.unwrap();

        store.delete(1, "asana", PipeType::Tasks).await.unwrap();

        assert!(store.load(1, "asana", PipeType::Tasks).await.unwrap().is_none());
        assert!(store.load_status(1, "asana", PipeType::Tasks).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_by_workspace_and_service_cascades() {
        let store = store().await;
        for pipe_type in [PipeType::Users, PipeType::Projects] {
            store.save(&pipe(1, "asana", pipe_type)).await.unwrap();
            store
                .save_status(&Status::new(1, "asana", pipe_type, Utc::now(), ""))
                .await
                .unwrap();
        }
        store.save(&pipe(1, "asana2", PipeType::Users)).await.unwrap();
        store.save(&pipe(2, "asana", PipeType::Users)).await.unwrap();

        store.delete_by_workspace_and_service(1, "asana").await.unwrap();

        let remaining: Vec<String> =
            store.load_all(1).await.unwrap().iter().map(Pipe::key).collect();
        assert_eq!(remaining, vec!["asana2:users"]);
        assert!(store.load_all_statuses(1).await.unwrap().is_empty());
        assert_eq!(store.load_all(2).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_is_down() {
        let store = store().await;
        assert!(!store.is_down().await);

        store.pool().close().await;
        assert!(store.is_down().await);
    }
}

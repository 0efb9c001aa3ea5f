//! Import snapshot persistence.
//!
//! A fetch phase stores what it pulled from the provider; the matching post
//! phase loads it back. Snapshots are keyed by the integration's composite
//! key for the entity, so two accounts of one provider never share one.

use async_trait::async_trait;
use bridge_traits::time::{Clock, SystemClock};
use core_auth::WorkspaceId;
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::error::{Result, SyncError};
use crate::integration::PipeIntegration;
use crate::models::ImportSnapshot;

/// Raw document storage for snapshots.
#[async_trait]
pub trait ImportsStore: Send + Sync {
    async fn load(&self, workspace_id: WorkspaceId, key: &str) -> Result<Option<String>>;

    async fn save(&self, workspace_id: WorkspaceId, key: &str, data: &str) -> Result<()>;

    async fn delete(&self, workspace_id: WorkspaceId, key: &str) -> Result<()>;
}

pub struct SqliteImportsStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl SqliteImportsStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl ImportsStore for SqliteImportsStore {
    async fn load(&self, workspace_id: WorkspaceId, key: &str) -> Result<Option<String>> {
        sqlx::query_scalar("SELECT data FROM imports WHERE workspace_id = ? AND key = ?")
            .bind(workspace_id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(SyncError::from_sqlx)
    }

    async fn save(&self, workspace_id: WorkspaceId, key: &str, data: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO imports (workspace_id, key, data, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (workspace_id, key) DO UPDATE SET
                data = excluded.data,
                created_at = excluded.created_at
            "#,
        )
        .bind(workspace_id)
        .bind(key)
        .bind(data)
        .bind(self.clock.now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(SyncError::from_sqlx)?;

        Ok(())
    }

    async fn delete(&self, workspace_id: WorkspaceId, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM imports WHERE workspace_id = ? AND key = ?")
            .bind(workspace_id)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(SyncError::from_sqlx)?;

        Ok(())
    }
}

/// Typed access to snapshots through an integration.
#[derive(Clone)]
pub struct Imports {
    store: Arc<dyn ImportsStore>,
}

impl Imports {
    pub fn new(store: Arc<dyn ImportsStore>) -> Self {
        Self { store }
    }

    pub async fn load_for<T: ImportSnapshot>(
        &self,
        integration: &dyn PipeIntegration,
    ) -> Result<Option<T>> {
        let key = integration.key_for(T::ENTITY);
        match self.store.load(integration.workspace_id(), &key).await? {
            Some(data) => Ok(Some(serde_json::from_str(&data).map_err(SyncError::json)?)),
            None => Ok(None),
        }
    }

    pub async fn save_for<T: ImportSnapshot>(
        &self,
        integration: &dyn PipeIntegration,
        snapshot: &T,
    ) -> Result<()> {
        let key = integration.key_for(T::ENTITY);
        let data = serde_json::to_string(snapshot).map_err(SyncError::json)?;
        self.store.save(integration.workspace_id(), &key, &data).await
    }

    pub async fn delete_for<T: ImportSnapshot>(
        &self,
        integration: &dyn PipeIntegration,
    ) -> Result<()> {
        let key = integration.key_for(T::ENTITY);
        self.store.delete(integration.workspace_id(), &key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;

    #[tokio::test]
    async fn test_raw_store_round_trip() {
        let store = SqliteImportsStore::new(create_test_pool().await.unwrap());

        assert!(store.load(1, "asana:users").await.unwrap().is_none());

        store.save(1, "asana:users", r#"{"users":[]}"#).await.unwrap();
        store.save(1, "asana:users", r#"{"users":[],"error":"x"}"#).await.unwrap();
        assert_eq!(
            store.load(1, "asana:users").await.unwrap().as_deref(),
            Some(r#"{"users":[],"error":"x"}"#)
        );

        store.delete(1, "asana:users").await.unwrap();
        assert!(store.load(1, "asana:users").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_created_at_comes_from_clock() {
        use bridge_traits::time::FixedClock;
        use chrono::{TimeZone, Utc};

        let at = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let pool = create_test_pool().await.unwrap();
        let store = SqliteImportsStore::new(pool.clone()).with_clock(Arc::new(FixedClock(at)));
        store.save(1, "asana:users", "{}").await.unwrap();

        let created_at: i64 = sqlx::query_scalar("SELECT created_at FROM imports")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(created_at, at.timestamp());
    }

    #[tokio::test]
    async fn test_invalid_document_is_a_persistence_error() {
        let pool = create_test_pool().await.unwrap();
        let store = SqliteImportsStore::new(pool);
        store.save(1, "k", "not json").await.unwrap();

        let raw = store.load(1, "k").await.unwrap().unwrap();
        let parsed: std::result::Result<crate::models::UsersResponse, _> =
            serde_json::from_str(&raw).map_err(SyncError::json);
        assert!(matches!(parsed, Err(SyncError::PersistenceFailed(_))));
    }
}

//! Authorization persistence.

use async_trait::async_trait;
use bridge_traits::time::{Clock, SystemClock};
use sqlx::{FromRow, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{AuthError, Result};
use crate::types::{Authorization, WorkspaceId};

/// Storage for per-(workspace, service) credentials.
#[async_trait]
pub trait AuthorizationStore: Send + Sync {
    /// Load the authorization for a service, `None` if the workspace never connected it.
    async fn load(
        &self,
        workspace_id: WorkspaceId,
        service_id: &str,
    ) -> Result<Option<Authorization>>;

    /// Insert or replace an authorization wholesale.
    async fn save(&self, authorization: &Authorization) -> Result<()>;

    async fn delete(&self, workspace_id: WorkspaceId, service_id: &str) -> Result<()>;

    /// Map of service id to "has an authorization" for a workspace.
    async fn load_workspace_authorizations(
        &self,
        workspace_id: WorkspaceId,
    ) -> Result<HashMap<String, bool>>;
}

/// SQLite implementation of [`AuthorizationStore`].
pub struct SqliteAuthorizationStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl SqliteAuthorizationStore {
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

    /// Create the `authorizations` table if it does not exist.
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS authorizations (
                workspace_id INTEGER NOT NULL,
                service_id TEXT NOT NULL,
                workspace_token TEXT NOT NULL,
                data TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (workspace_id, service_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AuthError::Storage(e.to_string()))?;

        Ok(())
    }
}

#[derive(Debug, FromRow)]
struct AuthorizationRow {
    workspace_id: i64,
    service_id: String,
    workspace_token: String,
    data: String,
}

impl TryFrom<AuthorizationRow> for Authorization {
    type Error = AuthError;

    fn try_from(row: AuthorizationRow) -> Result<Self> {
        let data = serde_json::from_str(&row.data).map_err(|e| {
            AuthError::InvalidToken(format!(
                "authorization blob for {} is not valid JSON: {}",
                row.service_id, e
            ))
        })?;

        Ok(Authorization {
            workspace_id: row.workspace_id,
            service_id: row.service_id,
            workspace_token: row.workspace_token,
            data,
        })
    }
}

#[async_trait]
impl AuthorizationStore for SqliteAuthorizationStore {
    async fn load(
        &self,
        workspace_id: WorkspaceId,
        service_id: &str,
    ) -> Result<Option<Authorization>> {
        let row = sqlx::query_as::<_, AuthorizationRow>(
            r#"
            SELECT workspace_id, service_id, workspace_token, data
            FROM authorizations
            WHERE workspace_id = ? AND service_id = ?
            "#,
        )
        .bind(workspace_id)
        .bind(service_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AuthError::Storage(e.to_string()))?;

        row.map(Authorization::try_from).transpose()
    }

    async fn save(&self, authorization: &Authorization) -> Result<()> {
        let data = serde_json::to_string(&authorization.data)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO authorizations (workspace_id, service_id, workspace_token, data, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (workspace_id, service_id) DO UPDATE SET
                workspace_token = excluded.workspace_token,
                data = excluded.data,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(authorization.workspace_id)
        .bind(&authorization.service_id)
        .bind(&authorization.workspace_token)
        .bind(data)
        .bind(self.clock.now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| AuthError::Storage(e.to_string()))?;

        Ok(())
    }

    async fn delete(&self, workspace_id: WorkspaceId, service_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM authorizations WHERE workspace_id = ? AND service_id = ?")
            .bind(workspace_id)
            .bind(service_id)
            .execute(&self.pool)
            .await
            .map_err(|e| AuthError::Storage(e.to_string()))?;

        Ok(())
    }

    async fn load_workspace_authorizations(
        &self,
        workspace_id: WorkspaceId,
    ) -> Result<HashMap<String, bool>> {
        let services: Vec<String> =
            sqlx::query_scalar("SELECT service_id FROM authorizations WHERE workspace_id = ?")
                .bind(workspace_id)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| AuthError::Storage(e.to_string()))?;

        Ok(services.into_iter().map(|s| (s, true)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> SqliteAuthorizationStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteAuthorizationStore::new(pool);
        store.initialize().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let store = store().await;
        let auth = Authorization::new(1, "asana", "ws-token", json!({"access_token": "a"}));

        store.save(&auth).await.unwrap();

        let loaded = store.load(1, "asana").await.unwrap().unwrap();
        assert_eq!(loaded, auth);
        assert!(store.load(2, "asana").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_updated_at_comes_from_clock() {
        use bridge_traits::time::FixedClock;
        use chrono::{TimeZone, Utc};

        let at = Utc.with_ymd_and_hms(2024, 4, 1, 10, 0, 0).unwrap();
        let store = store().await.with_clock(Arc::new(FixedClock(at)));
        store
            .save(&Authorization::new(1, "asana", "t", json!({})))
            .await
            .unwrap();

        let updated_at: i64 = sqlx::query_scalar("SELECT updated_at FROM authorizations")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(updated_at, at.timestamp());
    }

    #[tokio::test]
    async fn test_save_replaces_wholesale() {
        let store = store().await;
        store
            .save(&Authorization::new(1, "asana", "t1", json!({"access_token": "a"})))
            .await
            .unwrap();
        store
            .save(&Authorization::new(1, "asana", "t2", json!({"oauth_token": "b"})))
            .await
            .unwrap();

        let loaded = store.load(1, "asana").await.unwrap().unwrap();
        assert_eq!(loaded.workspace_token, "t2");
        assert_eq!(loaded.data, json!({"oauth_token": "b"}));
    }

    #[tokio::test]
    async fn test_workspace_authorizations_and_delete() {
        let store = store().await;
        for service in ["asana", "github"] {
            store
                .save(&Authorization::new(7, service, "t", json!({})))
                .await
                .unwrap();
        }
        store
            .save(&Authorization::new(8, "basecamp", "t", json!({})))
            .await
            .unwrap();

        let authorized = store.load_workspace_authorizations(7).await.unwrap();
        assert_eq!(authorized.len(), 2);
        assert_eq!(authorized.get("github"), Some(&true));

        store.delete(7, "github").await.unwrap();
        let authorized = store.load_workspace_authorizations(7).await.unwrap();
        assert_eq!(authorized.keys().collect::<Vec<_>>(), vec!["asana"]);
    }
}

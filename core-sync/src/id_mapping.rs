//! # ID Mapping Store
//!
//! Persistent foreign-id to central-id correspondence per
//! `(workspace, connection key)`.
//!
//! ## Overview
//!
//! Mappings are whole documents: callers load the full map, mutate it in
//! memory and save it back. Concurrent writers to the same key are kept
//! apart by the workspace lock and the queue's one-entry-per-workspace rule,
//! so saves are plain last-writer-wins upserts.
//!
//! The reversed view (`central id -> "foreign-entity"`) is built on read and
//! only used by the time-entry export direction.

use async_trait::async_trait;
use core_auth::WorkspaceId;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashMap;
use tracing::debug;

use crate::error::{Result, SyncError};

/// Separator between the foreign id and the entity tag in reversed values.
const REVERSED_SEPARATOR: char = '-';

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapping {
    pub workspace_id: WorkspaceId,
    pub key: String,
    pub data: HashMap<String, i64>,
}

impl IdMapping {
    pub fn new(workspace_id: WorkspaceId, key: impl Into<String>) -> Self {
        Self {
            workspace_id,
            key: key.into(),
            data: HashMap::new(),
        }
    }

    /// Central id for a foreign id, `0` when not imported yet.
    pub fn get(&self, foreign_id: &str) -> i64 {
        self.data.get(foreign_id).copied().unwrap_or_default()
    }

    /// Record an import result. Re-importing overwrites the previous central id.
    pub fn insert(&mut self, foreign_id: impl Into<String>, local_id: i64) {
        self.data.insert(foreign_id.into(), local_id);
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Central ids known to this mapping, sorted.
    pub fn local_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.data.values().copied().collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Inverted view tagged with the entity name taken from the key suffix.
    pub fn reversed(&self) -> ReversedIdMapping {
        let tag = self.key.rsplit(':').next().unwrap_or_default();
        let data = self
            .data
            .iter()
            .map(|(foreign, local)| (*local, format!("{}{}{}", foreign, REVERSED_SEPARATOR, tag)))
            .collect();
        ReversedIdMapping { data }
    }
}

/// `central id -> "foreignId-entity"`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReversedIdMapping {
    data: HashMap<i64, String>,
}

impl ReversedIdMapping {
    pub fn raw(&self, local_id: i64) -> Option<&str> {
        self.data.get(&local_id).map(String::as_str)
    }

    /// Numeric foreign id for a central id; `0` when unknown or malformed.
    pub fn get_foreign_id(&self, local_id: i64) -> i64 {
        self.raw(local_id)
            .and_then(|value| value.split(REVERSED_SEPARATOR).next())
            .and_then(|prefix| prefix.parse().ok())
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[async_trait]
pub trait IdMappingStore: Send + Sync {
    /// Load a mapping; a missing row yields an empty mapping, never an error.
    async fn load(&self, workspace_id: WorkspaceId, key: &str) -> Result<IdMapping>;

    async fn load_reversed(
        &self,
        workspace_id: WorkspaceId,
        key: &str,
    ) -> Result<ReversedIdMapping> {
        Ok(self.load(workspace_id, key).await?.reversed())
    }

    /// Full upsert of the mapping document.
    async fn save(&self, mapping: &IdMapping) -> Result<()>;

    /// Remove a mapping together with the pipe status it belongs to, atomically.
    async fn delete(
        &self,
        workspace_id: WorkspaceId,
        connection_key: &str,
        status_key: &str,
    ) -> Result<()>;
}

pub struct SqliteIdMappingStore {
    pool: SqlitePool,
}

impl SqliteIdMappingStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdMappingStore for SqliteIdMappingStore {
    async fn load(&self, workspace_id: WorkspaceId, key: &str) -> Result<IdMapping> {
        let data: Option<String> =
            sqlx::query_scalar("SELECT data FROM id_mappings WHERE workspace_id = ? AND key = ?")
                .bind(workspace_id)
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(SyncError::from_sqlx)?;

        let mut mapping = IdMapping::new(workspace_id, key);
        if let Some(data) = data {
            mapping.data = serde_json::from_str(&data).map_err(SyncError::json)?;
        }
        Ok(mapping)
    }

    async fn save(&self, mapping: &IdMapping) -> Result<()> {
        let data = serde_json::to_string(&mapping.data).map_err(SyncError::json)?;

        sqlx::query(
            r#"
            INSERT INTO id_mappings (workspace_id, key, data)
            VALUES (?, ?, ?)
            ON CONFLICT (workspace_id, key) DO UPDATE SET data = excluded.data
            "#,
        )
        .bind(mapping.workspace_id)
        .bind(&mapping.key)
        .bind(data)
        .execute(&self.pool)
        .await
        .map_err(SyncError::from_sqlx)?;

        debug!(
            workspace_id = mapping.workspace_id,
            key = %mapping.key,
            entries = mapping.len(),
            "Saved ID mapping"
        );
        Ok(())
    }

    async fn delete(
        &self,
        workspace_id: WorkspaceId,
        connection_key: &str,
        status_key: &str,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(SyncError::from_sqlx)?;

        sqlx::query("DELETE FROM id_mappings WHERE workspace_id = ? AND key = ?")
            .bind(workspace_id)
            .bind(connection_key)
            .execute(&mut *tx)
            .await
            .map_err(SyncError::from_sqlx)?;

        sqlx::query("DELETE FROM pipe_statuses WHERE workspace_id = ? AND key = ?")
            .bind(workspace_id)
            .bind(status_key)
            .execute(&mut *tx)
            .await
            .map_err(SyncError::from_sqlx)?;

        tx.commit().await.map_err(SyncError::from_sqlx)?;
        Ok(())
    }
}

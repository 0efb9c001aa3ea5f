//! # Provider Integrations
//!
//! The capability interface every third-party provider adapter implements,
//! and the registry that builds adapters by service id.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let mut registry = IntegrationRegistry::new();
//! registry.register("asana", |workspace_id| Box::new(AsanaIntegration::new(workspace_id)));
//!
//! let mut integration = registry.create("asana", workspace_id)?;
//! integration.set_params(&pipe.service_params)?;
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use core_auth::{Authorization, WorkspaceId};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, SyncError};
use crate::models::{AccountsResponse, Client, Project, Task, TimeEntry, User};
use crate::pipe::EntityType;

/// One provider adapter bound to one workspace.
///
/// Adapters are configured through the setters before any fetch call and
/// are used by a single run at a time.
#[async_trait]
pub trait PipeIntegration: Send + Sync {
    /// Service id, e.g. `"asana"`.
    fn id(&self) -> &str;

    fn workspace_id(&self) -> WorkspaceId;

    /// Stable composite key namespacing ID mappings and import snapshots,
    /// e.g. `"asana:account:42:projects"`.
    fn key_for(&self, entity: EntityType) -> String;

    /// Apply the pipe's service parameters.
    ///
    /// Returns [`SyncError::ParamsInvalid`] when the provider rejects them.
    fn set_params(&mut self, params: &serde_json::Value) -> Result<()>;

    fn set_auth_data(&mut self, authorization: &Authorization) -> Result<()>;

    /// Lower bound for incremental fetches.
    fn set_since(&mut self, since: DateTime<Utc>);

    async fn accounts(&self) -> Result<AccountsResponse>;

    async fn users(&self) -> Result<Vec<User>>;

    async fn clients(&self) -> Result<Vec<Client>>;

    async fn projects(&self) -> Result<Vec<Project>>;

    async fn tasks(&self) -> Result<Vec<Task>>;

    async fn todo_lists(&self) -> Result<Vec<Task>>;

    /// Create or update one time entry on the provider and return its
    /// provider id. `entry.foreign_id` is non-zero for updates.
    async fn export_time_entry(&self, entry: &TimeEntry) -> Result<i64>;
}

type IntegrationFactory = Arc<dyn Fn(WorkspaceId) -> Box<dyn PipeIntegration> + Send + Sync>;

/// Service id to adapter factory.
#[derive(Clone, Default)]
pub struct IntegrationRegistry {
    factories: HashMap<String, IntegrationFactory>,
}

impl IntegrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, service_id: impl Into<String>, factory: F)
    where
        F: Fn(WorkspaceId) -> Box<dyn PipeIntegration> + Send + Sync + 'static,
    {
        self.factories.insert(service_id.into(), Arc::new(factory));
    }

    pub fn with<F>(mut self, service_id: impl Into<String>, factory: F) -> Self
    where
        F: Fn(WorkspaceId) -> Box<dyn PipeIntegration> + Send + Sync + 'static,
    {
        self.register(service_id, factory);
        self
    }

    pub fn contains(&self, service_id: &str) -> bool {
        self.factories.contains_key(service_id)
    }

    /// Build a fresh adapter for a workspace.
    ///
    /// # Errors
    ///
    /// [`SyncError::UnsupportedService`] for ids nothing was registered under.
    pub fn create(
        &self,
        service_id: &str,
        workspace_id: WorkspaceId,
    ) -> Result<Box<dyn PipeIntegration>> {
        let factory = self
            .factories
            .get(service_id)
            .ok_or_else(|| SyncError::UnsupportedService(service_id.to_string()))?;
        Ok(factory(workspace_id))
    }

    pub fn service_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.factories.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl std::fmt::Debug for IntegrationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrationRegistry")
            .field("services", &self.service_ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullIntegration {
        workspace_id: WorkspaceId,
    }

    #[async_trait]
    impl PipeIntegration for NullIntegration {
        fn id(&self) -> &str {
            "null"
        }

        fn workspace_id(&self) -> WorkspaceId {
            self.workspace_id
        }

        fn key_for(&self, entity: EntityType) -> String {
            format!("null:{}", entity)
        }

        fn set_params(&mut self, _params: &serde_json::Value) -> Result<()> {
            Ok(())
        }

        fn set_auth_data(&mut self, _authorization: &Authorization) -> Result<()> {
            Ok(())
        }

        fn set_since(&mut self, _since: DateTime<Utc>) {}

        async fn accounts(&self) -> Result<AccountsResponse> {
            Ok(AccountsResponse::default())
        }

        async fn users(&self) -> Result<Vec<User>> {
            Ok(vec![])
        }

        async fn clients(&self) -> Result<Vec<Client>> {
            Ok(vec![])
        }

        async fn projects(&self) -> Result<Vec<Project>> {
            Ok(vec![])
        }

        async fn tasks(&self) -> Result<Vec<Task>> {
            Ok(vec![])
        }

        async fn todo_lists(&self) -> Result<Vec<Task>> {
            Ok(vec![])
        }

        async fn export_time_entry(&self, _entry: &TimeEntry) -> Result<i64> {
            Ok(0)
        }
    }

    #[test]
    fn test_create_registered_service() {
        let registry = IntegrationRegistry::new()
            .with("null", |workspace_id| Box::new(NullIntegration { workspace_id }));

        let integration = registry.create("null", 12).unwrap();
        assert_eq!(integration.id(), "null");
        assert_eq!(integration.workspace_id(), 12);
        assert_eq!(integration.key_for(EntityType::Projects), "null:projects");
        assert!(registry.contains("null"));
    }

    #[test]
    fn test_unknown_service_is_an_error() {
        let registry = IntegrationRegistry::new();
        match registry.create("freshbooks", 1) {
            Err(SyncError::UnsupportedService(id)) => assert_eq!(id, "freshbooks"),
            other => panic!(
                "expected UnsupportedService, got {:?}",
                other.map(|i| i.id().to_string())
            ),
        }
    }
}

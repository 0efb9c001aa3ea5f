//! Static integration catalog.

use async_trait::async_trait;
use core_auth::AuthorizationType;
use core_runtime::config::IntegrationConfig;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::{Result, SyncError};
use crate::pipe::PipeType;

/// One provider as presented to users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrationDescriptor {
    pub id: String,
    pub name: String,
    pub link: String,
    pub image: String,
    pub auth_type: AuthorizationType,
    pub pipes: Vec<PipeType>,
}

impl TryFrom<&IntegrationConfig> for IntegrationDescriptor {
    type Error = SyncError;

    fn try_from(config: &IntegrationConfig) -> Result<Self> {
        let auth_type = config.auth_type.parse().map_err(|_| {
            SyncError::ParamsInvalid(format!(
                "integration '{}' has unknown authorization type '{}'",
                config.id, config.auth_type
            ))
        })?;
        let pipes = config
            .pipes
            .iter()
            .map(|p| p.parse())
            .collect::<Result<Vec<PipeType>>>()?;

        Ok(Self {
            id: config.id.clone(),
            name: config.name.clone(),
            link: config.link.clone(),
            image: config.image.clone(),
            auth_type,
            pipes,
        })
    }
}

#[async_trait]
pub trait IntegrationsStore: Send + Sync {
    async fn load_integrations(&self) -> Vec<IntegrationDescriptor>;

    async fn load_authorization_type(&self, service_id: &str) -> Result<AuthorizationType>;

    async fn save_authorization_type(
        &self,
        service_id: &str,
        auth_type: AuthorizationType,
    ) -> Result<()>;

    async fn is_valid_service(&self, service_id: &str) -> bool;

    /// Whether the service offers the given pipe.
    async fn is_valid_pipe(&self, service_id: &str, pipe_id: &str) -> bool;
}

/// In-memory catalog seeded from configuration.
#[derive(Debug, Default)]
pub struct StaticIntegrationsStore {
    integrations: RwLock<Vec<IntegrationDescriptor>>,
}

impl StaticIntegrationsStore {
    pub fn new(integrations: Vec<IntegrationDescriptor>) -> Self {
        Self {
            integrations: RwLock::new(integrations),
        }
    }

    pub fn from_config(integrations: &[IntegrationConfig]) -> Result<Self> {
        let descriptors = integrations
            .iter()
            .map(IntegrationDescriptor::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(descriptors))
    }
}

#[async_trait]
impl IntegrationsStore for StaticIntegrationsStore {
    async fn load_integrations(&self) -> Vec<IntegrationDescriptor> {
        self.integrations.read().await.clone()
    }

    async fn load_authorization_type(&self, service_id: &str) -> Result<AuthorizationType> {
        self.integrations
            .read()
            .await
            .iter()
            .find(|i| i.id == service_id)
            .map(|i| i.auth_type)
            .ok_or_else(|| SyncError::UnsupportedService(service_id.to_string()))
    }

    async fn save_authorization_type(
        &self,
        service_id: &str,
        auth_type: AuthorizationType,
    ) -> Result<()> {
        let mut integrations = self.integrations.write().await;
        let integration = integrations
            .iter_mut()
            .find(|i| i.id == service_id)
            .ok_or_else(|| SyncError::UnsupportedService(service_id.to_string()))?;
        integration.auth_type = auth_type;
        Ok(())
    }

    async fn is_valid_service(&self, service_id: &str) -> bool {
        self.integrations.read().await.iter().any(|i| i.id == service_id)
    }

    async fn is_valid_pipe(&self, service_id: &str, pipe_id: &str) -> bool {
        let Ok(pipe_type) = pipe_id.parse::<PipeType>() else {
            return false;
        };
        self.integrations
            .read()
            .await
            .iter()
            .any(|i| i.id == service_id && i.pipes.contains(&pipe_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> StaticIntegrationsStore {
        StaticIntegrationsStore::from_config(&[
            IntegrationConfig::new("asana", "Asana", "oauth2")
                .with_pipes(["users", "projects", "tasks"]),
            IntegrationConfig::new("freshbooks", "FreshBooks", "oauth1")
                .with_pipes(["users", "projects", "timeentries"]),
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn test_catalog_lookup() {
        let store = catalog();

        assert_eq!(store.load_integrations().await.len(), 2);
        assert!(store.is_valid_service("asana").await);
        assert!(!store.is_valid_service("jira").await);
        assert!(store.is_valid_pipe("asana", "tasks").await);
        assert!(!store.is_valid_pipe("asana", "timeentries").await);
        assert!(!store.is_valid_pipe("asana", "invoices").await);
    }

    #[tokio::test]
    async fn test_authorization_type() {
        let store = catalog();
        assert_eq!(
            store.load_authorization_type("freshbooks").await.unwrap(),
            AuthorizationType::OAuth1
        );

        store
            .save_authorization_type("freshbooks", AuthorizationType::OAuth2)
            .await
            .unwrap();
        assert_eq!(
            store.load_authorization_type("freshbooks").await.unwrap(),
            AuthorizationType::OAuth2
        );

        assert!(matches!(
            store.load_authorization_type("jira").await,
            Err(SyncError::UnsupportedService(_))
        ));
    }

    #[test]
    fn test_unknown_auth_type_is_rejected() {
        let result =
            StaticIntegrationsStore::from_config(&[IntegrationConfig::new("x", "X", "saml")]);
        assert!(matches!(result, Err(SyncError::ParamsInvalid(_))));
    }
}

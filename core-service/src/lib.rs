//! Pipes service façade and bootstrap helpers.
//!
//! This crate wires the host configuration (HTTP client, clock, error sink,
//! integration catalog, OAuth2 clients) and the provider adapters into the
//! synchronization engine. Desktop hosts typically keep the default
//! `desktop-shims` feature, which supplies a reqwest-backed HTTP client when
//! the configuration does not inject one.

pub mod background;
pub mod error;
pub mod service;

pub use background::BackgroundRunner;
pub use error::{Result, ServiceError};
pub use service::{
    PipeSettings, PipesService, ServiceDependencies, WorkspaceIntegration, WorkspacePipe,
};

use core_runtime::config::PipesConfig;
use core_sync::db::{create_pool, DatabaseConfig};
use core_sync::{HttpCentralService, IntegrationRegistry};
use std::sync::Arc;

/// Open the database and build a [`PipesService`] talking to the configured
/// central service.
///
/// ```ignore
/// let config = PipesConfig::builder()
///     .database_url("sqlite://pipes.db")
///     .central_api_url("https://track.example.com")
///     .build()?;
/// let registry = IntegrationRegistry::new().with("github", |ws| Box::new(GitHub::new(ws)));
///
/// let service = core_service::bootstrap(config, registry).await?;
/// service.start_workers().await;
/// ```
pub async fn bootstrap(config: PipesConfig, registry: IntegrationRegistry) -> Result<PipesService> {
    let pool = create_pool(DatabaseConfig::new(config.database_url.clone())).await?;
    let central = Arc::new(HttpCentralService::new(
        config.http_client.clone(),
        config.central_api_url.clone(),
        config.request_timeout,
    ));

    PipesService::new(
        &config,
        ServiceDependencies {
            pool,
            central,
            registry,
        },
    )
    .await
}

//! # Pipes Service
//!
//! Composition root and request-level operations of the engine.
//!
//! ## Overview
//!
//! [`PipesService`] owns every store, the synchronizer, the queue, the
//! workspace-lock registry and the background runner. Each operation
//! validates the service and pipe ids against the integration catalog before
//! touching storage.
//!
//! ## Run now
//!
//! Users runs bypass the queue: the run is handed to the background runner,
//! acquires the workspace lock there, and acknowledges over a oneshot channel
//! once it holds the lock. The caller waits for that acknowledgement, bounded
//! by `run_start_timeout`. Every other pipe type is boosted to the front of
//! the queue and runs on the next drain cycle.

use bridge_traits::report::ErrorReporter;
use core_auth::{
    Authorization, AuthorizationGate, AuthorizationStore, AuthorizationType,
    SqliteAuthorizationStore, WorkspaceId,
};
use core_runtime::config::PipesConfig;
use core_runtime::events::EventBus;
use core_sync::models::{AccountsResponse, UsersResponse};
use core_sync::pipe::pipe_key;
use core_sync::{
    CentralService, IdMappingStore, Imports, IntegrationRegistry, IntegrationsStore, Pipe,
    PipeIntegration, PipeQueue, PipeStore, PipeSynchronizer, PipeType, SqliteIdMappingStore,
    SqliteImportsStore, SqlitePipeQueue, SqlitePipeStore, StaticIntegrationsStore, Status,
    SyncContext, SyncError, Synchronizer, UsersSelector, WorkerPool, WorkerPoolHandle,
    WorkerPoolSettings, WorkspaceLocks,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::background::BackgroundRunner;
use crate::error::{Result, ServiceError};

/// Collaborators the host provides to [`PipesService::new`].
pub struct ServiceDependencies {
    /// Pool with the engine migrations applied.
    pub pool: SqlitePool,
    pub central: Arc<dyn CentralService>,
    pub registry: IntegrationRegistry,
}

/// Editable part of a pipe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipeSettings {
    #[serde(default)]
    pub automatic: bool,
    #[serde(default)]
    pub service_params: serde_json::Value,
}

/// One pipe of a [`WorkspaceIntegration`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkspacePipe {
    pub id: PipeType,
    pub configured: bool,
    pub automatic: bool,
    pub status: Option<Status>,
}

/// A catalog entry as seen from one workspace.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkspaceIntegration {
    pub id: String,
    pub name: String,
    pub link: String,
    pub image: String,
    pub auth_type: AuthorizationType,
    pub authorized: bool,
    pub pipes: Vec<WorkspacePipe>,
}

pub struct PipesService {
    pipes: Arc<dyn PipeStore>,
    id_mappings: Arc<dyn IdMappingStore>,
    imports: Imports,
    integrations: Arc<dyn IntegrationsStore>,
    auth_store: Arc<dyn AuthorizationStore>,
    registry: Arc<IntegrationRegistry>,
    central: Arc<dyn CentralService>,
    queue: Arc<dyn PipeQueue>,
    synchronizer: Arc<Synchronizer>,
    locks: Arc<WorkspaceLocks>,
    background: BackgroundRunner,
    reporter: Arc<dyn ErrorReporter>,
    event_bus: EventBus,
    worker_settings: WorkerPoolSettings,
    workers: Mutex<Option<WorkerPoolHandle>>,
    run_start_timeout: Duration,
    health_check_timeout: Duration,
    pool: SqlitePool,
}

impl PipesService {
    /// Wire every component from a validated configuration.
    pub async fn new(config: &PipesConfig, deps: ServiceDependencies) -> Result<Self> {
        config.validate()?;

        let ServiceDependencies {
            pool,
            central,
            registry,
        } = deps;

        let event_bus = EventBus::new(config.event_buffer_size);

        let auth_store =
            Arc::new(SqliteAuthorizationStore::new(pool.clone()).with_clock(config.clock.clone()));
        auth_store.initialize().await?;
        let auth_store: Arc<dyn AuthorizationStore> = auth_store;

        let pipes: Arc<dyn PipeStore> =
            Arc::new(SqlitePipeStore::new(pool.clone()).with_clock(config.clock.clone()));
        let id_mappings: Arc<dyn IdMappingStore> =
            Arc::new(SqliteIdMappingStore::new(pool.clone()));
        let imports = Imports::new(Arc::new(
            SqliteImportsStore::new(pool.clone()).with_clock(config.clock.clone()),
        ));
        let integrations: Arc<dyn IntegrationsStore> =
            Arc::new(StaticIntegrationsStore::from_config(&config.integrations)?);
        let registry = Arc::new(registry);
        let gate = AuthorizationGate::from_config(auth_store.clone(), config, event_bus.clone());

        let context = SyncContext {
            pipes: pipes.clone(),
            id_mappings: id_mappings.clone(),
            imports: imports.clone(),
            integrations: integrations.clone(),
            registry: registry.clone(),
            gate: Arc::new(gate),
            central: central.clone(),
            clock: config.clock.clone(),
            reporter: config.error_reporter.clone(),
            event_bus: event_bus.clone(),
            host_url: config.host_url.clone(),
        };
        let synchronizer = Arc::new(Synchronizer::new(Arc::new(context)));

        let queue: Arc<dyn PipeQueue> = Arc::new(
            SqlitePipeQueue::new(
                pool.clone(),
                pipes.clone(),
                config.clock.clone(),
                event_bus.clone(),
            )
            .with_batch_size(config.queue_batch_size)
            .with_stale_lock_timeout(config.stale_lock_timeout),
        );

        info!(
            integrations = config.integrations.len(),
            providers = ?registry.service_ids(),
            workers = config.workers,
            "Pipes service initialized"
        );

        Ok(Self {
            pipes,
            id_mappings,
            imports,
            integrations,
            auth_store,
            registry,
            central,
            queue,
            synchronizer,
            locks: Arc::new(WorkspaceLocks::new()),
            background: BackgroundRunner::new(
                config.background_capacity,
                config.error_reporter.clone(),
            ),
            reporter: config.error_reporter.clone(),
            event_bus,
            worker_settings: WorkerPoolSettings::from(config),
            workers: Mutex::new(None),
            run_start_timeout: config.run_start_timeout,
            health_check_timeout: config.health_check_timeout,
            pool,
        })
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn synchronizer(&self) -> &Arc<Synchronizer> {
        &self.synchronizer
    }

    pub fn locks(&self) -> &Arc<WorkspaceLocks> {
        &self.locks
    }

    // ------------------------------------------------------------------
    // Validation helpers
    // ------------------------------------------------------------------

    async fn validate_service(&self, service_id: &str) -> Result<()> {
        if self.integrations.is_valid_service(service_id).await {
            Ok(())
        } else {
            Err(ServiceError::InvalidService(service_id.to_string()))
        }
    }

    async fn validate_pipe(&self, service_id: &str, pipe_id: &str) -> Result<PipeType> {
        self.validate_service(service_id).await?;
        if !self.integrations.is_valid_pipe(service_id, pipe_id).await {
            return Err(ServiceError::InvalidPipe {
                service_id: service_id.to_string(),
                pipe_id: pipe_id.to_string(),
            });
        }
        Ok(pipe_id.parse::<PipeType>()?)
    }

    async fn load_configured(
        &self,
        workspace_id: WorkspaceId,
        service_id: &str,
        pipe_type: PipeType,
    ) -> Result<Pipe> {
        self.pipes
            .load(workspace_id, service_id, pipe_type)
            .await?
            .ok_or_else(|| {
                SyncError::NotConfigured {
                    service_id: service_id.to_string(),
                    pipe_id: pipe_type.to_string(),
                }
                .into()
            })
    }

    /// Parameters for snapshot keys: the given pipe's own, else any
    /// configured pipe of the same service.
    async fn stored_params(
        &self,
        workspace_id: WorkspaceId,
        service_id: &str,
        preferred: PipeType,
    ) -> Result<serde_json::Value> {
        let pipes: Vec<Pipe> = self
            .pipes
            .load_all(workspace_id)
            .await?
            .into_iter()
            .filter(|p| p.service_id == service_id && !p.service_params.is_null())
            .collect();

        Ok(pipes
            .iter()
            .find(|p| p.pipe_type == preferred)
            .or_else(|| pipes.first())
            .map(|p| p.service_params.clone())
            .unwrap_or(serde_json::Value::Null))
    }

    /// Users runs need a selection of users, which only a run-now request
    /// carries, so they cannot be automatic.
    fn check_settings(pipe_type: PipeType, settings: &PipeSettings) -> Result<()> {
        if pipe_type == PipeType::Users && settings.automatic {
            let reason = "users pipes cannot run automatically".to_string();
            return Err(SyncError::ParamsInvalid(reason).into());
        }
        Ok(())
    }

    fn integration_for(
        &self,
        workspace_id: WorkspaceId,
        service_id: &str,
        params: &serde_json::Value,
    ) -> Result<Box<dyn PipeIntegration>> {
        let mut integration = self.registry.create(service_id, workspace_id)?;
        integration.set_params(params)?;
        Ok(integration)
    }

    // ------------------------------------------------------------------
    // Pipes
    // ------------------------------------------------------------------

    /// The stored pipe, or an unconfigured placeholder.
    pub async fn get_pipe(
        &self,
        workspace_id: WorkspaceId,
        service_id: &str,
        pipe_id: &str,
    ) -> Result<Pipe> {
        let pipe_type = self.validate_pipe(service_id, pipe_id).await?;
        Ok(self
            .pipes
            .load(workspace_id, service_id, pipe_type)
            .await?
            .unwrap_or_else(|| Pipe::new(workspace_id, service_id, pipe_type)))
    }

    #[instrument(skip(self, settings))]
    pub async fn create_pipe(
        &self,
        workspace_id: WorkspaceId,
        service_id: &str,
        pipe_id: &str,
        settings: PipeSettings,
    ) -> Result<Pipe> {
        let pipe_type = self.validate_pipe(service_id, pipe_id).await?;
        Self::check_settings(pipe_type, &settings)?;

        let mut pipe = Pipe::new(workspace_id, service_id, pipe_type);
        pipe.automatic = settings.automatic;
        pipe.service_params = settings.service_params;
        self.pipes.save(&pipe).await?;

        info!(automatic = pipe.automatic, "Pipe created");
        pipe.configured = true;
        Ok(pipe)
    }

    /// Change the settings of a configured pipe, keeping its sync history.
    #[instrument(skip(self, settings))]
    pub async fn update_pipe(
        &self,
        workspace_id: WorkspaceId,
        service_id: &str,
        pipe_id: &str,
        settings: PipeSettings,
    ) -> Result<Pipe> {
        let pipe_type = self.validate_pipe(service_id, pipe_id).await?;
        Self::check_settings(pipe_type, &settings)?;
        let mut pipe = self.load_configured(workspace_id, service_id, pipe_type).await?;

        pipe.automatic = settings.automatic;
        pipe.service_params = settings.service_params;
        self.pipes.save(&pipe).await?;

        info!(automatic = pipe.automatic, "Pipe updated");
        Ok(pipe)
    }

    #[instrument(skip(self))]
    pub async fn delete_pipe(
        &self,
        workspace_id: WorkspaceId,
        service_id: &str,
        pipe_id: &str,
    ) -> Result<()> {
        let pipe_type = self.validate_pipe(service_id, pipe_id).await?;
        self.load_configured(workspace_id, service_id, pipe_type).await?;
        self.pipes.delete(workspace_id, service_id, pipe_type).await?;
        info!("Pipe deleted");
        Ok(())
    }

    pub async fn pipe_status(
        &self,
        workspace_id: WorkspaceId,
        service_id: &str,
        pipe_id: &str,
    ) -> Result<Option<Status>> {
        let pipe_type = self.validate_pipe(service_id, pipe_id).await?;
        Ok(self.pipes.load_status(workspace_id, service_id, pipe_type).await?)
    }

    /// Plain-text log of the last run.
    pub async fn pipe_log(
        &self,
        workspace_id: WorkspaceId,
        service_id: &str,
        pipe_id: &str,
    ) -> Result<Option<String>> {
        Ok(self
            .pipe_status(workspace_id, service_id, pipe_id)
            .await?
            .map(|status| status.generate_log()))
    }

    /// The catalog with authorization state and per-pipe configuration.
    pub async fn workspace_integrations(
        &self,
        workspace_id: WorkspaceId,
    ) -> Result<Vec<WorkspaceIntegration>> {
        let authorized = self.auth_store.load_workspace_authorizations(workspace_id).await?;
        let pipes: HashMap<String, Pipe> = self
            .pipes
            .load_all(workspace_id)
            .await?
            .into_iter()
            .map(|pipe| (pipe.key(), pipe))
            .collect();
        let mut statuses = self.pipes.load_all_statuses(workspace_id).await?;

        let integrations = self
            .integrations
            .load_integrations()
            .await
            .into_iter()
            .map(|descriptor| {
                let pipes = descriptor
                    .pipes
                    .iter()
                    .map(|pipe_type| {
                        let key = pipe_key(&descriptor.id, *pipe_type);
                        let stored = pipes.get(&key);
                        WorkspacePipe {
                            id: *pipe_type,
                            configured: stored.map(|p| p.configured).unwrap_or(false),
                            automatic: stored.map(|p| p.automatic).unwrap_or(false),
                            status: statuses.remove(&key),
                        }
                    })
                    .collect();

                WorkspaceIntegration {
                    authorized: authorized.get(&descriptor.id).copied().unwrap_or(false),
                    id: descriptor.id,
                    name: descriptor.name,
                    link: descriptor.link,
                    image: descriptor.image,
                    auth_type: descriptor.auth_type,
                    pipes,
                }
            })
            .collect();

        Ok(integrations)
    }

    // ------------------------------------------------------------------
    // Authorizations and mappings
    // ------------------------------------------------------------------

    /// Store credentials produced by an external OAuth flow.
    #[instrument(
        skip(self, authorization),
        fields(workspace_id = authorization.workspace_id, service_id = %authorization.service_id)
    )]
    pub async fn save_authorization(&self, authorization: Authorization) -> Result<()> {
        self.validate_service(&authorization.service_id).await?;
        self.auth_store.save(&authorization).await?;
        info!("Authorization saved");
        Ok(())
    }

    /// Disconnect a service: drop its credentials and every pipe of it.
    #[instrument(skip(self))]
    pub async fn delete_authorization(
        &self,
        workspace_id: WorkspaceId,
        service_id: &str,
    ) -> Result<()> {
        self.validate_service(service_id).await?;
        self.auth_store.delete(workspace_id, service_id).await?;
        self.pipes
            .delete_by_workspace_and_service(workspace_id, service_id)
            .await?;
        info!("Authorization deleted with its pipes");
        Ok(())
    }

    /// Forget which central records a pipe's entities map to, and its status.
    ///
    /// Deprecated path, kept for hosts that still expose "clear connections".
    #[instrument(skip(self))]
    pub async fn clear_id_mappings(
        &self,
        workspace_id: WorkspaceId,
        service_id: &str,
        pipe_id: &str,
    ) -> Result<()> {
        let pipe_type = self.validate_pipe(service_id, pipe_id).await?;
        let params = self.stored_params(workspace_id, service_id, pipe_type).await?;
        let integration = self.integration_for(workspace_id, service_id, &params)?;

        let connection_key = integration.key_for(pipe_type.entity());
        self.id_mappings
            .delete(workspace_id, &connection_key, &pipe_key(service_id, pipe_type))
            .await?;
        info!(connection_key = %connection_key, "ID mappings cleared");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Cached provider users.
    ///
    /// `None` means an import was started in the background; ask again later.
    #[instrument(skip(self))]
    pub async fn service_users(
        &self,
        workspace_id: WorkspaceId,
        service_id: &str,
        force_refresh: bool,
    ) -> Result<Option<UsersResponse>> {
        self.validate_pipe(service_id, PipeType::Users.as_str()).await?;
        let params = self.stored_params(workspace_id, service_id, PipeType::Users).await?;
        let integration = self.integration_for(workspace_id, service_id, &params)?;

        if force_refresh {
            self.imports.delete_for::<UsersResponse>(integration.as_ref()).await?;
        } else if let Some(snapshot) = self
            .imports
            .load_for::<UsersResponse>(integration.as_ref())
            .await?
        {
            return Ok(Some(snapshot));
        }

        let synchronizer = self.synchronizer.clone();
        let service_id = service_id.to_string();
        self.background.submit("import_users", async move {
            synchronizer
                .import_users(workspace_id, &service_id, &params)
                .await
        })?;
        debug!("Users import submitted");
        Ok(None)
    }

    /// Cached provider accounts. Same cache-miss contract as [`Self::service_users`].
    #[instrument(skip(self))]
    pub async fn service_accounts(
        &self,
        workspace_id: WorkspaceId,
        service_id: &str,
        force_refresh: bool,
    ) -> Result<Option<AccountsResponse>> {
        self.validate_service(service_id).await?;
        let params = self.stored_params(workspace_id, service_id, PipeType::Users).await?;
        let integration = self.integration_for(workspace_id, service_id, &params)?;

        if force_refresh {
            self.imports.delete_for::<AccountsResponse>(integration.as_ref()).await?;
        } else if let Some(snapshot) = self
            .imports
            .load_for::<AccountsResponse>(integration.as_ref())
            .await?
        {
            return Ok(Some(snapshot));
        }

        let synchronizer = self.synchronizer.clone();
        let service_id = service_id.to_string();
        self.background.submit("import_accounts", async move {
            synchronizer
                .import_accounts(workspace_id, &service_id, &params)
                .await
        })?;
        debug!("Accounts import submitted");
        Ok(None)
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    /// Run a pipe as soon as possible.
    ///
    /// # Errors
    ///
    /// - [`SyncError::ParamsInvalid`] for a Users run without selected users
    /// - [`ServiceError::RunStartTimeout`] when a Users run could not take
    ///   the workspace lock in time; it still runs once the lock frees up
    #[instrument(skip(self, users_selector))]
    pub async fn schedule_pipe_synchronization(
        &self,
        workspace_id: WorkspaceId,
        service_id: &str,
        pipe_id: &str,
        users_selector: Option<UsersSelector>,
    ) -> Result<()> {
        let pipe_type = self.validate_pipe(service_id, pipe_id).await?;
        let mut pipe = self.load_configured(workspace_id, service_id, pipe_type).await?;

        if pipe_type != PipeType::Users {
            self.queue.queue_pipe_now(&pipe).await?;
            info!("Pipe moved to the front of the queue");
            return Ok(());
        }

        match users_selector {
            Some(selector) if !selector.ids.is_empty() => pipe.users_selector = Some(selector),
            _ => return Err(SyncError::ParamsInvalid("no users selected".to_string()).into()),
        }

        self.run_now(pipe).await
    }

    async fn run_now(&self, pipe: Pipe) -> Result<()> {
        let (started_tx, started_rx) = oneshot::channel();
        let locks = self.locks.clone();
        let synchronizer = self.synchronizer.clone();
        let cancel = self.background.cancellation_token();

        self.background.submit("run_pipe_now", async move {
            let _guard = tokio::select! {
                guard = locks.acquire(pipe.workspace_id) => guard,
                _ = cancel.cancelled() => {
                    debug!("Shutdown before the run could start");
                    return Ok(());
                }
            };
            let _ = started_tx.send(());

            let status = synchronizer.synchronize(&pipe).await;
            debug!(state = %status.state, "On-demand run finished");
            Ok(())
        })?;

        match tokio::time::timeout(self.run_start_timeout, started_rx).await {
            Ok(Ok(())) => {
                debug!("On-demand run started");
                Ok(())
            }
            Ok(Err(_)) | Err(_) => {
                warn!(timeout = ?self.run_start_timeout, "On-demand run has not started");
                Err(ServiceError::RunStartTimeout(self.run_start_timeout))
            }
        }
    }

    /// Start the auto-enqueue and drain loops. A second call is a no-op.
    pub async fn start_workers(&self) {
        let mut workers = self.workers.lock().await;
        if workers.is_some() {
            warn!("Worker pool already running");
            return;
        }

        let synchronizer: Arc<dyn PipeSynchronizer> = self.synchronizer.clone();
        let pool = Arc::new(WorkerPool::new(
            self.worker_settings,
            self.queue.clone(),
            synchronizer,
            self.locks.clone(),
            self.reporter.clone(),
        ));
        *workers = Some(pool.start());
    }

    // ------------------------------------------------------------------
    // Health and lifecycle
    // ------------------------------------------------------------------

    /// Reasons the service is not ready; empty when healthy.
    pub async fn ready(&self) -> Vec<String> {
        let mut errors = Vec::new();

        match tokio::time::timeout(self.health_check_timeout, self.pipes.is_down()).await {
            Ok(false) => {}
            Ok(true) => errors.push("storage is unreachable".to_string()),
            Err(_) => errors.push("storage health check timed out".to_string()),
        }

        match tokio::time::timeout(self.health_check_timeout, self.central.ping()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(error = %e, "Central service ping failed");
                errors.push("central service is unreachable".to_string());
            }
            Err(_) => errors.push("central service health check timed out".to_string()),
        }

        errors
    }

    /// Stop the worker pool, drain background work and close storage.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.workers.lock().await.take() {
            handle.shutdown().await;
        }
        self.background.shutdown().await;
        self.pool.close().await;
        info!("Pipes service stopped");
    }
}

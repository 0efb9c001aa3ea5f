//! # Synchronization Orchestrator
//!
//! Runs one pipe from `running` to a terminal status.
//!
//! ## Workflow
//!
//! 1. Resolve the lower bound: the pipe's `last_sync`, else `start_date`
//!    from its service parameters, else now
//! 2. Persist a fresh `running` status (overwrites the previous one). A
//!    pipe deleted since it was dequeued is not run
//! 3. Resolve the authorization through the [`AuthorizationGate`],
//!    refreshing expired OAuth2 tokens
//! 4. Build the provider adapter and inject parameters, credentials and the
//!    lower bound
//! 5. Dispatch by pipe type (see [`pipeline`](crate::pipeline))
//! 6. Persist the terminal status, whatever happened before
//! 7. On success, advance `last_sync` to the run start. Only that column is
//!    written, so settings changed during the run are kept and a pipe
//!    deleted during the run stays deleted
//!
//! A run never retries internally; the next scheduled run is the retry.

use async_trait::async_trait;
use bridge_traits::report::{ErrorReport, ErrorReporter};
use bridge_traits::time::Clock;
use chrono::{DateTime, Utc};
use core_auth::{Authorization, AuthorizationGate, WorkspaceId};
use core_runtime::events::{CoreEvent, EventBus, SyncEvent};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::central::CentralService;
use crate::error::{Result, SyncError};
use crate::id_mapping::IdMappingStore;
use crate::imports::Imports;
use crate::integration::{IntegrationRegistry, PipeIntegration};
use crate::integrations::IntegrationsStore;
use crate::models::{AccountsResponse, ImportSnapshot, UsersResponse};
use crate::pipe::Pipe;
use crate::pipe_store::PipeStore;
use crate::pipeline::Pipeline;
use crate::status::{Status, SyncState};

/// Runs pipes. Implemented by [`Synchronizer`] and by test doubles.
#[async_trait]
pub trait PipeSynchronizer: Send + Sync {
    /// Run a pipe to completion. Failures are recorded on the returned
    /// status rather than returned.
    async fn synchronize(&self, pipe: &Pipe) -> Status;
}

/// Collaborators shared by every run.
#[derive(Clone)]
pub struct SyncContext {
    pub pipes: Arc<dyn PipeStore>,
    pub id_mappings: Arc<dyn IdMappingStore>,
    pub imports: Imports,
    pub integrations: Arc<dyn IntegrationsStore>,
    pub registry: Arc<IntegrationRegistry>,
    pub gate: Arc<AuthorizationGate>,
    pub central: Arc<dyn CentralService>,
    pub clock: Arc<dyn Clock>,
    pub reporter: Arc<dyn ErrorReporter>,
    pub event_bus: EventBus,
    /// Base URL for the per-pipe log link on statuses.
    pub host_url: String,
}

impl SyncContext {
    pub(crate) fn report(&self, pipe: &Pipe, operation: &str, error: &SyncError) {
        self.reporter.report(
            ErrorReport::new(operation, error.to_string())
                .with_workspace(pipe.workspace_id)
                .with_service(pipe.service_id.clone())
                .with_pipe(pipe.pipe_type.as_str()),
        );
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.event_bus.emit(CoreEvent::Sync(event));
    }
}

pub struct Synchronizer {
    ctx: Arc<SyncContext>,
}

impl Synchronizer {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    /// A provider adapter configured with fresh credentials.
    ///
    /// Shared by pipe runs and on-demand snapshot imports.
    pub async fn authorized_integration(
        &self,
        workspace_id: WorkspaceId,
        service_id: &str,
        service_params: &serde_json::Value,
    ) -> Result<(Box<dyn PipeIntegration>, Authorization)> {
        let auth_type = self.ctx.integrations.load_authorization_type(service_id).await?;
        let authorization = self.ctx.gate.authorize(workspace_id, service_id, auth_type).await?;

        let mut integration = self.ctx.registry.create(service_id, workspace_id)?;
        integration.set_params(service_params)?;
        integration.set_auth_data(&authorization)?;

        Ok((integration, authorization))
    }

    /// Refresh the accounts snapshot outside a pipe run.
    ///
    /// Provider failures are stored on the snapshot so the next read shows them.
    #[instrument(skip(self, service_params))]
    pub async fn import_accounts(
        &self,
        workspace_id: WorkspaceId,
        service_id: &str,
        service_params: &serde_json::Value,
    ) -> Result<()> {
        let (integration, _) = self
            .authorized_integration(workspace_id, service_id, service_params)
            .await?;
        let snapshot = integration
            .accounts()
            .await
            .unwrap_or_else(|e| AccountsResponse::with_error(e.user_message()));
        self.ctx.imports.save_for(integration.as_ref(), &snapshot).await
    }

    /// Refresh the users snapshot outside a pipe run.
    #[instrument(skip(self, service_params))]
    pub async fn import_users(
        &self,
        workspace_id: WorkspaceId,
        service_id: &str,
        service_params: &serde_json::Value,
    ) -> Result<()> {
        let (integration, _) = self
            .authorized_integration(workspace_id, service_id, service_params)
            .await?;
        let snapshot = match integration.users().await {
            Ok(users) => UsersResponse { error: None, users },
            Err(e) => UsersResponse::with_error(e.user_message()),
        };
        self.ctx.imports.save_for(integration.as_ref(), &snapshot).await
    }

    async fn resolve_since(&self, pipe: &Pipe, now: DateTime<Utc>) -> DateTime<Utc> {
        let stored = match self.ctx.pipes.load_last_sync_for(pipe).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(error = %e, "Failed to load last sync, using in-memory value");
                pipe.last_sync
            }
        };
        stored.or_else(|| pipe.start_date()).unwrap_or(now)
    }

    async fn execute(&self, pipe: &Pipe, since: DateTime<Utc>, status: &mut Status) -> Result<()> {
        let (mut integration, authorization) = self
            .authorized_integration(pipe.workspace_id, &pipe.service_id, &pipe.service_params)
            .await?;
        integration.set_since(since);

        let central = self.ctx.central.with_auth_token(&authorization.workspace_token);
        Pipeline::new(&self.ctx, integration.as_ref(), central, pipe, since, status)
            .run()
            .await
    }

    /// `false` once the pipe is gone from storage. Failed writes are reported
    /// and count as present.
    async fn persist_status(&self, pipe: &Pipe, status: &Status) -> bool {
        match self.ctx.pipes.save_status(status).await {
            Ok(stored) => stored,
            Err(e) => {
                error!(error = %e, state = %status.state, "Failed to persist pipe status");
                self.ctx.report(pipe, "save_status", &e);
                true
            }
        }
    }

    async fn advance_last_sync(&self, pipe: &Pipe, started_at: DateTime<Utc>) {
        let updated = self
            .ctx
            .pipes
            .update_last_sync(pipe.workspace_id, &pipe.service_id, pipe.pipe_type, started_at)
            .await;
        match updated {
            Ok(true) => {}
            Ok(false) => info!("Pipe was removed during the run, last sync not recorded"),
            Err(e) => {
                error!(error = %e, "Failed to advance last sync");
                self.ctx.report(pipe, "save_last_sync", &e);
            }
        }
    }
}

#[async_trait]
impl PipeSynchronizer for Synchronizer {
    #[instrument(
        skip(self, pipe),
        fields(
            workspace_id = pipe.workspace_id,
            service_id = %pipe.service_id,
            pipe_id = %pipe.pipe_type
        )
    )]
    async fn synchronize(&self, pipe: &Pipe) -> Status {
        let started_at = self.ctx.clock.now();
        let since = self.resolve_since(pipe, started_at).await;

        let mut status = Status::new(
            pipe.workspace_id,
            pipe.service_id.clone(),
            pipe.pipe_type,
            started_at,
            &self.ctx.host_url,
        );
        if !self.persist_status(pipe, &status).await {
            info!("Pipe no longer exists, skipping run");
            status.add_error(
                SyncError::NotConfigured {
                    service_id: pipe.service_id.clone(),
                    pipe_id: pipe.pipe_type.to_string(),
                }
                .user_message(),
            );
            return status;
        }
        self.ctx.emit(SyncEvent::Started {
            workspace_id: pipe.workspace_id,
            service_id: pipe.service_id.clone(),
            pipe_id: pipe.pipe_type.as_str().to_string(),
        });
        info!(since = %since, "Pipe synchronization started");

        if let Err(e) = self.execute(pipe, since, &mut status).await {
            error!(error = %e, "Pipe synchronization failed");
            status.add_error(e.user_message());
            self.ctx.report(pipe, "synchronize", &e);
        }

        // Statuses never stay `running` past the end of a run.
        if status.state == SyncState::Running {
            status.complete(pipe.pipe_type.entity(), Vec::new(), 0);
        }

        let still_stored = self.persist_status(pipe, &status).await;
        if !still_stored {
            info!("Pipe was removed during the run, status dropped");
        }

        if status.state == SyncState::Success {
            if still_stored {
                self.advance_last_sync(pipe, started_at).await;
            }
            info!(object_counts = ?status.object_counts, "Pipe synchronization completed");
            self.ctx.emit(SyncEvent::Completed {
                workspace_id: pipe.workspace_id,
                service_id: pipe.service_id.clone(),
                pipe_id: pipe.pipe_type.as_str().to_string(),
                object_counts: status.object_counts.clone(),
            });
        } else {
            self.ctx.emit(SyncEvent::Failed {
                workspace_id: pipe.workspace_id,
                service_id: pipe.service_id.clone(),
                pipe_id: pipe.pipe_type.as_str().to_string(),
                message: status.message.clone(),
            });
        }

        status
    }
}

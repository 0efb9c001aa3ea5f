//! # Entity Pipelines
//!
//! Fetch-then-post synchronization per entity type.
//!
//! ## Overview
//!
//! Every entity except time entries runs in two phases:
//!
//! - **fetch**: pull the provider's list, reconcile known central ids from the
//!   ID mappings and persist the result as an import snapshot
//! - **post**: load the snapshot, send it to the central service and fold the
//!   returned central ids back into the entity's ID mapping
//!
//! Dependencies run first and completely: projects need clients, tasks and
//! todo lists need projects. A failing dependency aborts the dependent
//! entity before its own fetch.
//!
//! Time entries go the other way: they are read from the central service and
//! exported one by one. A failing entry is recorded and the loop continues.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::central::CentralService;
use crate::error::{Result, SyncError};
use crate::id_mapping::IdMapping;
use crate::integration::PipeIntegration;
use crate::models::{
    ClientRequest, ClientsResponse, ImportResult, ImportSnapshot, ProjectRequest,
    ProjectsResponse, Task, TasksImport, TasksResponse, TodoListsResponse, UsersRequest,
    UsersResponse,
};
use crate::pipe::{EntityType, Pipe, PipeType};
use crate::request_size::adjust_request_size;
use crate::status::Status;
use crate::synchronizer::SyncContext;

pub(crate) struct Pipeline<'a> {
    ctx: &'a SyncContext,
    integration: &'a dyn PipeIntegration,
    central: Arc<dyn CentralService>,
    pipe: &'a Pipe,
    since: DateTime<Utc>,
    status: &'a mut Status,
}

impl<'a> Pipeline<'a> {
    pub(crate) fn new(
        ctx: &'a SyncContext,
        integration: &'a dyn PipeIntegration,
        central: Arc<dyn CentralService>,
        pipe: &'a Pipe,
        since: DateTime<Utc>,
        status: &'a mut Status,
    ) -> Self {
        Self {
            ctx,
            integration,
            central,
            pipe,
            since,
            status,
        }
    }

    pub(crate) async fn run(mut self) -> Result<()> {
        match self.pipe.pipe_type {
            PipeType::Users => self.sync_users().await,
            PipeType::Projects => self.sync_projects().await,
            PipeType::TodoLists => self.sync_todo_lists().await,
            PipeType::Tasks | PipeType::Todos => self.sync_tasks().await,
            PipeType::TimeEntries => self.sync_time_entries().await,
        }
    }

    async fn load_mapping(&self, entity: EntityType) -> Result<IdMapping> {
        self.ctx
            .id_mappings
            .load(self.integration.workspace_id(), &self.integration.key_for(entity))
            .await
    }

    /// Record central ids returned by an import and complete the entity.
    async fn apply_import<R: ImportResult>(
        &mut self,
        entity: EntityType,
        import: &R,
    ) -> Result<()> {
        let mut mapping = self.load_mapping(entity).await?;
        for (foreign_id, local_id) in import.mapped_ids() {
            mapping.insert(foreign_id, local_id);
        }
        self.ctx.id_mappings.save(&mapping).await?;

        self.status
            .complete(entity, import.notifications().to_vec(), import.count());
        info!(entity = %entity, count = import.count(), "Import applied");
        Ok(())
    }

    /// Load the snapshot the fetch phase left for the post phase.
    async fn load_snapshot<T: ImportSnapshot>(&self) -> Result<T> {
        let snapshot: T = self
            .ctx
            .imports
            .load_for::<T>(self.integration)
            .await?
            .ok_or_else(|| SyncError::MissingImport {
                entity: T::ENTITY.to_string(),
            })?;

        if let Some(error) = snapshot.error() {
            return Err(SyncError::UpstreamCallFailed(error.to_string()));
        }
        Ok(snapshot)
    }

    /// Persist a fetched snapshot, or the provider error as the snapshot.
    async fn store_snapshot<T: ImportSnapshot>(&self, fetched: Result<T>) -> Result<()> {
        match fetched {
            Ok(snapshot) => self.ctx.imports.save_for(self.integration, &snapshot).await,
            Err(e) => {
                let snapshot = T::with_error(e.user_message());
                let recorded = self.ctx.imports.save_for(self.integration, &snapshot).await;
                if let Err(store_error) = recorded {
                    warn!(error = %store_error, "Failed to record fetch error on snapshot");
                }
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    async fn fetch_users(&self) -> Result<()> {
        let fetched = self.integration.users().await.map(|users| UsersResponse {
            error: None,
            users,
        });
        self.store_snapshot(fetched).await
    }

    async fn sync_users(&mut self) -> Result<()> {
        self.fetch_users().await?;

        let selector = self.pipe.users_selector.clone().unwrap_or_default();
        if selector.ids.is_empty() {
            return Err(SyncError::ParamsInvalid("no users selected".to_string()));
        }

        let snapshot: UsersResponse = self.load_snapshot().await?;
        let selected: HashSet<&str> = selector.ids.iter().map(String::as_str).collect();
        let users = snapshot
            .users
            .into_iter()
            .filter(|user| selected.contains(user.foreign_id.as_str()))
            .collect();

        let import = self
            .central
            .post_users(&UsersRequest {
                users,
                send_invites: selector.send_invites,
            })
            .await?;
        self.apply_import(EntityType::Users, &import).await
    }

    // ------------------------------------------------------------------
    // Clients and projects
    // ------------------------------------------------------------------

    async fn fetch_clients(&self) -> Result<()> {
        let mapping = self.load_mapping(EntityType::Clients).await?;
        let fetched = self.integration.clients().await.map(|clients| ClientsResponse {
            error: None,
            clients: clients
                .into_iter()
                .map(|mut client| {
                    client.name = client.name.trim().to_string();
                    client.id = mapping.get(&client.foreign_id);
                    client
                })
                .collect(),
        });
        self.store_snapshot(fetched).await
    }

    async fn sync_clients(&mut self) -> Result<()> {
        self.fetch_clients().await?;

        let snapshot: ClientsResponse = self.load_snapshot().await?;
        let import = self
            .central
            .post_clients(&ClientRequest {
                clients: snapshot.clients,
            })
            .await?;
        self.apply_import(EntityType::Clients, &import).await
    }

    async fn fetch_projects(&self) -> Result<()> {
        let projects_mapping = self.load_mapping(EntityType::Projects).await?;
        let clients_mapping = self.load_mapping(EntityType::Clients).await?;

        let fetched = self.integration.projects().await.map(|projects| ProjectsResponse {
            error: None,
            projects: projects
                .into_iter()
                .map(|mut project| {
                    project.name = project.name.trim().to_string();
                    project.id = projects_mapping.get(&project.foreign_id);
                    if let Some(foreign_client_id) = &project.foreign_client_id {
                        project.client_id = clients_mapping.get(foreign_client_id);
                    }
                    project
                })
                .collect(),
        });
        self.store_snapshot(fetched).await
    }

    async fn sync_projects(&mut self) -> Result<()> {
        self.sync_clients().await?;
        self.fetch_projects().await?;

        let snapshot: ProjectsResponse = self.load_snapshot().await?;
        let import = self
            .central
            .post_projects(&ProjectRequest {
                projects: snapshot.projects,
            })
            .await?;
        self.apply_import(EntityType::Projects, &import).await
    }

    // ------------------------------------------------------------------
    // Tasks and todo lists
    // ------------------------------------------------------------------

    /// Reconcile ids and keep tasks that are active or already imported.
    async fn reconcile_tasks(
        &self,
        entity: EntityType,
        tasks: Vec<Task>,
    ) -> Result<Vec<Task>> {
        let tasks_mapping = self.load_mapping(entity).await?;
        let projects_mapping = self.load_mapping(EntityType::Projects).await?;

        let total = tasks.len();
        let kept: Vec<_> = tasks
            .into_iter()
            .map(|mut task| {
                task.name = task.name.trim().to_string();
                task.id = tasks_mapping.get(&task.foreign_id);
                if let Some(foreign_project_id) = &task.foreign_project_id {
                    task.project_id = projects_mapping.get(foreign_project_id);
                }
                task
            })
            .filter(|task| task.active || task.id > 0)
            .collect();

        debug!(entity = %entity, total, kept = kept.len(), "Reconciled tasks");
        Ok(kept)
    }

    async fn fetch_tasks(&self) -> Result<()> {
        let fetched = match self.integration.tasks().await {
            Ok(tasks) => Ok(TasksResponse {
                error: None,
                tasks: self.reconcile_tasks(EntityType::Tasks, tasks).await?,
            }),
            Err(e) => Err(e),
        };
        self.store_snapshot(fetched).await
    }

    async fn sync_tasks(&mut self) -> Result<()> {
        self.sync_projects().await?;
        self.fetch_tasks().await?;

        let snapshot: TasksResponse = self.load_snapshot().await?;
        let mut import = TasksImport::default();
        for request in adjust_request_size(&snapshot.tasks, 1)? {
            import.merge(self.central.post_tasks(&request).await?);
        }
        self.apply_import(EntityType::Tasks, &import).await
    }

    async fn fetch_todo_lists(&self) -> Result<()> {
        let fetched = match self.integration.todo_lists().await {
            Ok(lists) => Ok(TodoListsResponse {
                error: None,
                todo_lists: self.reconcile_tasks(EntityType::TodoLists, lists).await?,
            }),
            Err(e) => Err(e),
        };
        self.store_snapshot(fetched).await
    }

    async fn sync_todo_lists(&mut self) -> Result<()> {
        self.sync_projects().await?;
        self.fetch_todo_lists().await?;

        let snapshot: TodoListsResponse = self.load_snapshot().await?;
        let mut import = TasksImport::default();
        for request in adjust_request_size(&snapshot.todo_lists, 1)? {
            import.merge(self.central.post_todo_lists(&request).await?);
        }
        self.apply_import(EntityType::TodoLists, &import).await
    }

    // ------------------------------------------------------------------
    // Time entries
    // ------------------------------------------------------------------

    async fn sync_time_entries(&mut self) -> Result<()> {
        let users = self.load_mapping(EntityType::Users).await?;
        let projects = self.load_mapping(EntityType::Projects).await?;
        let tasks = self.load_mapping(EntityType::Tasks).await?;

        for (entity, mapping) in [(EntityType::Users, &users), (EntityType::Projects, &projects)] {
            if mapping.is_empty() {
                return Err(SyncError::MissingIdMappings {
                    entity: entity.to_string(),
                });
            }
        }

        let users_reversed = users.reversed();
        let projects_reversed = projects.reversed();
        let tasks_reversed = tasks.reversed();
        let mut entries_mapping = self.load_mapping(EntityType::TimeEntries).await?;
        let entries_reversed = entries_mapping.reversed();

        let entries = self
            .central
            .get_time_entries(self.since, &users.local_ids(), &projects.local_ids())
            .await?;

        let mut exported = 0;
        for mut entry in entries {
            entry.foreign_id = entries_reversed.get_foreign_id(entry.id);
            entry.foreign_user_id = users_reversed.get_foreign_id(entry.user_id);
            entry.foreign_project_id = projects_reversed.get_foreign_id(entry.project_id);
            entry.foreign_task_id = tasks_reversed.get_foreign_id(entry.task_id);

            match self.integration.export_time_entry(&entry).await {
                Ok(foreign_id) => {
                    entries_mapping.insert(foreign_id.to_string(), entry.id);
                    exported += 1;
                }
                Err(e) => {
                    warn!(time_entry_id = entry.id, error = %e, "Time entry export failed");
                    self.status.add_error(e.user_message());
                    self.ctx.report(self.pipe, "export_time_entry", &e);
                }
            }
        }

        self.ctx.id_mappings.save(&entries_mapping).await?;
        self.status.complete(EntityType::TimeEntries, Vec::new(), exported);
        Ok(())
    }
}

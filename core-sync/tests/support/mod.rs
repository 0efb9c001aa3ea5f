//! Shared doubles for the engine scenario tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bridge_traits::report::{ErrorReport, ErrorReporter};
use bridge_traits::time::{Clock, FixedClock};
use chrono::{DateTime, TimeZone, Utc};
use core_auth::{
    Authorization, AuthorizationGate, AuthorizationStore, AuthorizationType,
    SqliteAuthorizationStore, WorkspaceId,
};
use core_runtime::config::IntegrationConfig;
use core_runtime::events::EventBus;
use core_sync::central::CentralService;
use core_sync::db::create_test_pool;
use core_sync::models::{
    AccountsResponse, Client, ClientRequest, ClientsImport, Project, ProjectRequest,
    ProjectsImport, Task, TaskRequest, TasksImport, TimeEntry, User, UsersImport, UsersRequest,
};
use core_sync::{
    EntityType, IdMapping, IdMappingStore, Imports, IntegrationRegistry, Pipe, PipeIntegration,
    PipeStore, PipeType, Result, SqliteIdMappingStore, SqliteImportsStore, SqlitePipeStore,
    StaticIntegrationsStore, SyncContext, SyncError, Synchronizer,
};
use serde_json::json;
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

pub const SERVICE: &str = "fake";
pub const ACCOUNT_ID: i64 = 1;

pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

pub fn key(entity: EntityType) -> String {
    format!("{}:account:{}:{}", SERVICE, ACCOUNT_ID, entity)
}

// ============================================================================
// Provider double
// ============================================================================

#[derive(Default)]
pub struct ProviderState {
    pub users: Vec<User>,
    pub clients: Vec<Client>,
    pub projects: Vec<Project>,
    pub tasks: Vec<Task>,
    pub todo_lists: Vec<Task>,
    pub fail_projects: Option<String>,
    pub failing_exports: HashSet<i64>,
    pub exported: Vec<TimeEntry>,
    pub calls: Vec<String>,
    pub seen_access_tokens: Vec<String>,
    /// Access token found in storage at the moment of the first provider call.
    pub stored_token_at_call: Option<String>,
    pub auth_store: Option<Arc<dyn AuthorizationStore>>,
    /// Applied to the stored pipe during the first provider call.
    pub pipe_change: Option<(Arc<dyn PipeStore>, Pipe, PipeChange)>,
}

/// Concurrent edit made while a run is in progress.
pub enum PipeChange {
    Delete,
    /// Turn off `automatic` and add a `label` parameter.
    Edit,
}

pub struct FakeIntegration {
    workspace_id: WorkspaceId,
    account_id: i64,
    state: Arc<Mutex<ProviderState>>,
}

impl FakeIntegration {
    async fn record(&self, call: &str) {
        let (store, pipe_change) = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(call.to_string());
            let pipe_change = state.pipe_change.take();
            if state.stored_token_at_call.is_some() {
                (None, pipe_change)
            } else {
                (state.auth_store.clone(), pipe_change)
            }
        };

        if let Some((pipes, mut pipe, change)) = pipe_change {
            match change {
                PipeChange::Delete => pipes
                    .delete(pipe.workspace_id, &pipe.service_id, pipe.pipe_type)
                    .await
                    .unwrap(),
                PipeChange::Edit => {
                    pipe.automatic = false;
                    pipe.service_params["label"] = json!("edited");
                    pipes.save(&pipe).await.unwrap();
                }
            }
        }

        if let Some(store) = store {
            let stored = store
                .load(self.workspace_id, SERVICE)
                .await
                .unwrap()
                .and_then(|a| a.data["access_token"].as_str().map(str::to_string));
            self.state.lock().unwrap().stored_token_at_call = stored;
        }
    }
}

#[async_trait]
impl PipeIntegration for FakeIntegration {
    fn id(&self) -> &str {
        SERVICE
    }

    fn workspace_id(&self) -> WorkspaceId {
        self.workspace_id
    }

    fn key_for(&self, entity: EntityType) -> String {
        format!("{}:account:{}:{}", SERVICE, self.account_id, entity)
    }

    fn set_params(&mut self, params: &serde_json::Value) -> Result<()> {
        self.account_id = params
            .get("account_id")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| SyncError::ParamsInvalid("account_id is required".to_string()))?;
        Ok(())
    }

    fn set_auth_data(&mut self, authorization: &Authorization) -> Result<()> {
        if let Some(token) = authorization.data["access_token"].as_str() {
            self.state
                .lock()
                .unwrap()
                .seen_access_tokens
                .push(token.to_string());
        }
        Ok(())
    }

    fn set_since(&mut self, _since: DateTime<Utc>) {}

    async fn accounts(&self) -> Result<AccountsResponse> {
        self.record("accounts").await;
        Ok(AccountsResponse::default())
    }

    async fn users(&self) -> Result<Vec<User>> {
        self.record("users").await;
        Ok(self.state.lock().unwrap().users.clone())
    }

    async fn clients(&self) -> Result<Vec<Client>> {
        self.record("clients").await;
        Ok(self.state.lock().unwrap().clients.clone())
    }

    async fn projects(&self) -> Result<Vec<Project>> {
        self.record("projects").await;
        let state = self.state.lock().unwrap();
        match &state.fail_projects {
            Some(message) => Err(SyncError::UpstreamCallFailed(message.clone())),
            None => Ok(state.projects.clone()),
        }
    }

    async fn tasks(&self) -> Result<Vec<Task>> {
        self.record("tasks").await;
        Ok(self.state.lock().unwrap().tasks.clone())
    }

    async fn todo_lists(&self) -> Result<Vec<Task>> {
        self.record("todolists").await;
        Ok(self.state.lock().unwrap().todo_lists.clone())
    }

    async fn export_time_entry(&self, entry: &TimeEntry) -> Result<i64> {
        self.record("export_time_entry").await;
        let mut state = self.state.lock().unwrap();
        if state.failing_exports.contains(&entry.id) {
            return Err(SyncError::UpstreamCallFailed(format!(
                "entry {} rejected",
                entry.id
            )));
        }
        state.exported.push(entry.clone());
        Ok(if entry.foreign_id > 0 {
            entry.foreign_id
        } else {
            entry.id + 10_000
        })
    }
}

// ============================================================================
// Central service double
// ============================================================================

#[derive(Default)]
pub struct CentralState {
    next_id: i64,
    ids: HashMap<String, i64>,
    pub posts: Vec<String>,
    pub posted_users: Vec<User>,
    pub posted_tasks: Vec<Task>,
    pub task_batches: Vec<usize>,
    pub time_entries: Vec<TimeEntry>,
    pub time_entry_queries: Vec<(Vec<i64>, Vec<i64>)>,
    pub tokens: Vec<String>,
}

impl CentralState {
    fn assign(&mut self, entity: &str, foreign_id: &str, existing: i64) -> i64 {
        if existing > 0 {
            return existing;
        }
        let next = &mut self.next_id;
        *self
            .ids
            .entry(format!("{}:{}", entity, foreign_id))
            .or_insert_with(|| {
                *next += 1;
                *next + 100
            })
    }
}

#[derive(Clone)]
pub struct FakeCentral {
    pub state: Arc<Mutex<CentralState>>,
}

impl FakeCentral {
    fn record(&self, entity: &str) {
        self.state.lock().unwrap().posts.push(entity.to_string());
    }
}

#[async_trait]
impl CentralService for FakeCentral {
    fn with_auth_token(&self, token: &str) -> Arc<dyn CentralService> {
        self.state.lock().unwrap().tokens.push(token.to_string());
        Arc::new(self.clone())
    }

    async fn post_users(&self, request: &UsersRequest) -> Result<UsersImport> {
        self.record("users");
        let mut state = self.state.lock().unwrap();
        state.posted_users.extend(request.users.iter().cloned());
        let users = request
            .users
            .iter()
            .map(|u| User {
                id: state.assign("users", &u.foreign_id, u.id),
                ..u.clone()
            })
            .collect();
        Ok(UsersImport {
            users,
            notifications: vec![],
        })
    }

    async fn post_clients(&self, request: &ClientRequest) -> Result<ClientsImport> {
        self.record("clients");
        let mut state = self.state.lock().unwrap();
        let clients = request
            .clients
            .iter()
            .map(|c| Client {
                id: state.assign("clients", &c.foreign_id, c.id),
                ..c.clone()
            })
            .collect();
        Ok(ClientsImport {
            clients,
            notifications: vec![],
        })
    }

    async fn post_projects(&self, request: &ProjectRequest) -> Result<ProjectsImport> {
        self.record("projects");
        let mut state = self.state.lock().unwrap();
        let projects = request
            .projects
            .iter()
            .map(|p| Project {
                id: state.assign("projects", &p.foreign_id, p.id),
                ..p.clone()
            })
            .collect();
        Ok(ProjectsImport {
            projects,
            notifications: vec!["project notice".to_string()],
        })
    }

    async fn post_tasks(&self, request: &TaskRequest) -> Result<TasksImport> {
        self.record("tasks");
        let mut state = self.state.lock().unwrap();
        state.task_batches.push(request.tasks.len());
        state.posted_tasks.extend(request.tasks.iter().cloned());
        let tasks = request
            .tasks
            .iter()
            .map(|t| Task {
                id: state.assign("tasks", &t.foreign_id, t.id),
                ..t.clone()
            })
            .collect();
        Ok(TasksImport {
            tasks,
            notifications: vec![],
        })
    }

    async fn post_todo_lists(&self, request: &TaskRequest) -> Result<TasksImport> {
        self.record("todolists");
        let mut state = self.state.lock().unwrap();
        let tasks = request
            .tasks
            .iter()
            .map(|t| Task {
                id: state.assign("todolists", &t.foreign_id, t.id),
                ..t.clone()
            })
            .collect();
        Ok(TasksImport {
            tasks,
            notifications: vec![],
        })
    }

    async fn get_time_entries(
        &self,
        _since: DateTime<Utc>,
        user_ids: &[i64],
        project_ids: &[i64],
    ) -> Result<Vec<TimeEntry>> {
        let mut state = self.state.lock().unwrap();
        state
            .time_entry_queries
            .push((user_ids.to_vec(), project_ids.to_vec()));
        Ok(state.time_entries.clone())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// Error sink
// ============================================================================

#[derive(Default)]
pub struct RecordingReporter {
    pub reports: Mutex<Vec<ErrorReport>>,
}

impl RecordingReporter {
    pub fn operations(&self) -> Vec<String> {
        self.reports
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.operation.clone())
            .collect()
    }
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, report: ErrorReport) {
        self.reports.lock().unwrap().push(report);
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub pool: SqlitePool,
    pub pipes: Arc<SqlitePipeStore>,
    pub id_mappings: Arc<SqliteIdMappingStore>,
    pub auth_store: Arc<SqliteAuthorizationStore>,
    pub imports: Imports,
    pub provider: Arc<Mutex<ProviderState>>,
    pub central: FakeCentral,
    pub reporter: Arc<RecordingReporter>,
    pub event_bus: EventBus,
    pub synchronizer: Synchronizer,
}

impl Harness {
    pub async fn new(auth_type: AuthorizationType) -> Self {
        Self::with_gate(auth_type, |gate| gate).await
    }

    pub async fn with_gate<F>(auth_type: AuthorizationType, customize: F) -> Self
    where
        F: FnOnce(AuthorizationGate) -> AuthorizationGate,
    {
        let pool = create_test_pool().await.unwrap();
        let clock: Arc<dyn Clock> = Arc::new(FixedClock(now()));
        let auth_store =
            Arc::new(SqliteAuthorizationStore::new(pool.clone()).with_clock(clock.clone()));
        auth_store.initialize().await.unwrap();

        let pipes = Arc::new(SqlitePipeStore::new(pool.clone()).with_clock(clock.clone()));
        let id_mappings = Arc::new(SqliteIdMappingStore::new(pool.clone()));
        let imports = Imports::new(Arc::new(
            SqliteImportsStore::new(pool.clone()).with_clock(clock.clone()),
        ));
        let event_bus = EventBus::new(64);
        let reporter = Arc::new(RecordingReporter::default());

        let integrations = StaticIntegrationsStore::from_config(&[IntegrationConfig::new(
            SERVICE,
            "Fake",
            auth_type.as_str(),
        )
        .with_pipes(PipeType::ALL.iter().map(|p| p.as_str()))])
        .unwrap();

        let provider = Arc::new(Mutex::new(ProviderState::default()));
        let factory_state = provider.clone();
        let registry = IntegrationRegistry::new().with(SERVICE, move |workspace_id| {
            Box::new(FakeIntegration {
                workspace_id,
                account_id: 0,
                state: factory_state.clone(),
            })
        });

        let gate = customize(AuthorizationGate::new(
            auth_store.clone(),
            clock.clone(),
            event_bus.clone(),
        ));

        let central = FakeCentral {
            state: Arc::new(Mutex::new(CentralState::default())),
        };

        let ctx = SyncContext {
            pipes: pipes.clone(),
            id_mappings: id_mappings.clone(),
            imports: imports.clone(),
            integrations: Arc::new(integrations),
            registry: Arc::new(registry),
            gate: Arc::new(gate),
            central: Arc::new(central.clone()),
            clock,
            reporter: reporter.clone(),
            event_bus: event_bus.clone(),
            host_url: "https://pipes.example.com".to_string(),
        };

        Self {
            pool,
            pipes,
            id_mappings,
            auth_store,
            imports,
            provider,
            central,
            reporter,
            event_bus,
            synchronizer: Synchronizer::new(Arc::new(ctx)),
        }
    }

    /// Store an OAuth1-style credential blob.
    pub async fn authorize(&self, workspace_id: WorkspaceId) {
        self.auth_store
            .save(&Authorization::new(
                workspace_id,
                SERVICE,
                "ws-token",
                json!({"token": "t", "secret": "s"}),
            ))
            .await
            .unwrap();
    }

    pub async fn add_pipe(&self, workspace_id: WorkspaceId, pipe_type: PipeType) -> Pipe {
        let mut pipe = Pipe::new(workspace_id, SERVICE, pipe_type);
        pipe.automatic = true;
        pipe.service_params = json!({"account_id": ACCOUNT_ID, "start_date": "2024-01-01"});
        self.pipes.save(&pipe).await.unwrap();
        self.pipes
            .load(workspace_id, SERVICE, pipe_type)
            .await
            .unwrap()
            .unwrap()
    }

    pub async fn mapping(&self, workspace_id: WorkspaceId, entity: EntityType) -> IdMapping {
        self.id_mappings.load(workspace_id, &key(entity)).await.unwrap()
    }

    pub async fn seed_mapping(
        &self,
        workspace_id: WorkspaceId,
        entity: EntityType,
        entries: &[(&str, i64)],
    ) {
        let mut mapping = IdMapping::new(workspace_id, key(entity));
        for (foreign, local) in entries {
            mapping.insert(*foreign, *local);
        }
        self.id_mappings.save(&mapping).await.unwrap();
    }

    pub fn change_pipe_during_run(&self, pipe: &Pipe, change: PipeChange) {
        let pipes: Arc<dyn PipeStore> = self.pipes.clone();
        self.provider().pipe_change = Some((pipes, pipe.clone(), change));
    }

    pub fn provider(&self) -> std::sync::MutexGuard<'_, ProviderState> {
        self.provider.lock().unwrap()
    }

    pub fn central(&self) -> std::sync::MutexGuard<'_, CentralState> {
        self.central.state.lock().unwrap()
    }
}

pub fn user(foreign_id: &str) -> User {
    User {
        id: 0,
        email: format!("{}@example.com", foreign_id),
        name: foreign_id.to_uppercase(),
        foreign_id: foreign_id.to_string(),
    }
}

pub fn client(foreign_id: &str, name: &str) -> Client {
    Client {
        id: 0,
        name: name.to_string(),
        foreign_id: foreign_id.to_string(),
    }
}

pub fn project(foreign_id: &str, name: &str, foreign_client_id: Option<&str>) -> Project {
    Project {
        name: name.to_string(),
        active: true,
        foreign_id: foreign_id.to_string(),
        foreign_client_id: foreign_client_id.map(str::to_string),
        ..Project::default()
    }
}

pub fn task(foreign_id: &str, active: bool, foreign_project_id: &str) -> Task {
    Task {
        name: format!("Task {}", foreign_id),
        active,
        foreign_id: foreign_id.to_string(),
        foreign_project_id: Some(foreign_project_id.to_string()),
        ..Task::default()
    }
}

pub fn time_entry(id: i64, user_id: i64, project_id: i64, task_id: i64) -> TimeEntry {
    TimeEntry {
        id,
        project_id,
        task_id,
        user_id,
        billable: false,
        start: now(),
        stop: None,
        duration_in_seconds: 600,
        description: format!("entry {}", id),
        foreign_id: 0,
        foreign_task_id: 0,
        foreign_user_id: 0,
        foreign_project_id: 0,
    }
}

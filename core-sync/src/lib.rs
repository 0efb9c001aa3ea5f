//! # Pipes Synchronization Engine
//!
//! Reconciles users, clients, projects, tasks and time entries between the
//! central time-tracking service and third-party providers.
//!
//! ## Overview
//!
//! The worker pool drains the persistent queue; each dequeued pipe is run by
//! the synchronizer, which authorizes through the gate, fetches provider data
//! into import snapshots, reconciles ids through the ID mappings, posts to the
//! central service and records a status.
//!
//! ## Components
//!
//! - **Queue** (`queue`): durable, priority-ordered, one entry per workspace per batch
//! - **Worker Pool** (`worker`): auto-enqueue and drain loops with jittered sleeps
//! - **Synchronizer** (`synchronizer`, `pipeline`): the per-run state machine and entity pipelines
//! - **ID Mappings** (`id_mapping`): foreign to central id documents
//! - **Stores** (`pipe_store`, `imports`, `integrations`): pipe configuration, statuses, snapshots, catalog
//! - **Central Service** (`central`, `request_size`): import API client and payload splitting
//! - **Provider Integrations** (`integration`): the adapter capability and its registry
//! - **Workspace Locks** (`locks`): serializes runs of one workspace

pub mod central;
pub mod db;
pub mod error;
pub mod id_mapping;
pub mod imports;
pub mod integration;
pub mod integrations;
pub mod locks;
pub mod models;
pub mod pipe;
mod pipeline;
pub mod pipe_store;
pub mod queue;
pub mod request_size;
pub mod status;
pub mod synchronizer;
pub mod worker;

pub use central::{CentralService, HttpCentralService};
pub use error::{Result, SyncError};
pub use id_mapping::{IdMapping, IdMappingStore, ReversedIdMapping, SqliteIdMappingStore};
pub use imports::{Imports, ImportsStore, SqliteImportsStore};
pub use integration::{IntegrationRegistry, PipeIntegration};
pub use integrations::{IntegrationDescriptor, IntegrationsStore, StaticIntegrationsStore};
pub use locks::WorkspaceLocks;
pub use pipe::{EntityType, Pipe, PipeType, UsersSelector};
pub use pipe_store::{PipeStore, SqlitePipeStore};
pub use queue::{PipeQueue, Priority, SqlitePipeQueue};
pub use request_size::{adjust_request_size, MAX_PAYLOAD_SIZE};
pub use status::{Status, SyncState};
pub use synchronizer::{PipeSynchronizer, SyncContext, Synchronizer};
pub use worker::{WorkerPool, WorkerPoolHandle, WorkerPoolSettings};

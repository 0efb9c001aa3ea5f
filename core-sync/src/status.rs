//! Per-pipe run status and its user-visible text log.

use chrono::{DateTime, SecondsFormat, Utc};
use core_auth::WorkspaceId;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::pipe::{EntityType, PipeType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Running,
    Success,
    Error,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Running => "running",
            SyncState::Success => "success",
            SyncState::Error => "error",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The current run record of one pipe.
///
/// A fresh status is written at the start of every run and replaced by the
/// terminal one when the run ends. The terminal state is sticky towards
/// `error`: once [`Status::add_error`] ran, later [`Status::complete`] calls
/// (e.g. from a dependency prefix) no longer flip it back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub workspace_id: WorkspaceId,
    pub service_id: String,
    pub pipe_id: String,
    #[serde(rename = "status")]
    pub state: SyncState,
    #[serde(default)]
    pub message: String,
    pub sync_log: String,
    pub sync_date: DateTime<Utc>,
    #[serde(default)]
    pub object_counts: Vec<String>,
    #[serde(default)]
    pub notifications: Vec<String>,
}

impl Status {
    pub fn new(
        workspace_id: WorkspaceId,
        service_id: impl Into<String>,
        pipe_type: PipeType,
        sync_date: DateTime<Utc>,
        host_url: &str,
    ) -> Self {
        let service_id = service_id.into();
        let sync_log = format!(
            "{}/api/v1/integrations/{}/pipes/{}/log",
            host_url.trim_end_matches('/'),
            service_id,
            pipe_type.as_str()
        );

        Self {
            workspace_id,
            service_id,
            pipe_id: pipe_type.as_str().to_string(),
            state: SyncState::Running,
            message: String::new(),
            sync_log,
            sync_date,
            object_counts: Vec::new(),
            notifications: Vec::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == SyncState::Running
    }

    pub fn is_error(&self) -> bool {
        self.state == SyncState::Error
    }

    /// Record a successful entity sync.
    pub fn complete(&mut self, entity: EntityType, notifications: Vec<String>, count: usize) {
        if self.state == SyncState::Error {
            return;
        }

        self.state = SyncState::Success;
        self.object_counts.push(format!("{} {}", count, entity));
        self.notifications.extend(notifications);
        self.message = if count > 0 {
            format!("{} {} successfully imported/exported", count, entity)
        } else {
            format!("No new {} were imported/exported", entity)
        };
    }

    pub fn add_error(&mut self, message: impl Into<String>) {
        self.state = SyncState::Error;
        self.message = message.into();
    }

    /// Plain-text log served to users.
    pub fn generate_log(&self) -> String {
        format!(
            "{} {}\n{}\n{}\n{}\n{}",
            self.service_id,
            self.pipe_id,
            self.sync_date.to_rfc3339_opts(SecondsFormat::Secs, true),
            LOG_SEPARATOR,
            self.message,
            self.notifications.join("\n")
        )
    }
}

const LOG_SEPARATOR: &str = "===============================================";

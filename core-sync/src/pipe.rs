//! Pipe identity and configuration.

use chrono::{DateTime, NaiveDate, Utc};
use core_auth::WorkspaceId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SyncError};

/// The entity a pipe synchronizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipeType {
    Users,
    Projects,
    TodoLists,
    Tasks,
    Todos,
    TimeEntries,
}

impl PipeType {
    pub const ALL: [PipeType; 6] = [
        PipeType::Users,
        PipeType::Projects,
        PipeType::TodoLists,
        PipeType::Tasks,
        PipeType::Todos,
        PipeType::TimeEntries,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipeType::Users => "users",
            PipeType::Projects => "projects",
            PipeType::TodoLists => "todolists",
            PipeType::Tasks => "tasks",
            PipeType::Todos => "todos",
            PipeType::TimeEntries => "timeentries",
        }
    }

    /// Entity whose counters end up on the pipe's status.
    pub fn entity(&self) -> EntityType {
        match self {
            PipeType::Users => EntityType::Users,
            PipeType::Projects => EntityType::Projects,
            PipeType::TodoLists => EntityType::TodoLists,
            PipeType::Tasks | PipeType::Todos => EntityType::Tasks,
            PipeType::TimeEntries => EntityType::TimeEntries,
        }
    }
}

impl FromStr for PipeType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        PipeType::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| SyncError::UnsupportedPipe(s.to_string()))
    }
}

impl fmt::Display for PipeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entity kinds that have import snapshots and ID mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Accounts,
    Users,
    Clients,
    Projects,
    Tasks,
    TodoLists,
    TimeEntries,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Accounts => "accounts",
            EntityType::Users => "users",
            EntityType::Clients => "clients",
            EntityType::Projects => "projects",
            EntityType::Tasks => "tasks",
            EntityType::TodoLists => "todolists",
            EntityType::TimeEntries => "timeentries",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Explicit subset of foreign users to import on a Users run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsersSelector {
    #[serde(default)]
    pub ids: Vec<String>,
    #[serde(default)]
    pub send_invites: bool,
}

/// One (workspace, service, entity) synchronization unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipe {
    pub workspace_id: WorkspaceId,
    pub service_id: String,
    pub pipe_type: PipeType,
    pub automatic: bool,
    pub configured: bool,
    /// Provider parameters, interpreted only by the provider adapter.
    pub service_params: serde_json::Value,
    pub last_sync: Option<DateTime<Utc>>,
    /// Only meaningful for Users runs; never persisted.
    #[serde(skip)]
    pub users_selector: Option<UsersSelector>,
}

impl Pipe {
    pub fn new(
        workspace_id: WorkspaceId,
        service_id: impl Into<String>,
        pipe_type: PipeType,
    ) -> Self {
        Self {
            workspace_id,
            service_id: service_id.into(),
            pipe_type,
            automatic: false,
            configured: false,
            service_params: serde_json::Value::Null,
            last_sync: None,
            users_selector: None,
        }
    }

    /// Stable key of the pipe inside its workspace, shared by the queue and statuses.
    pub fn key(&self) -> String {
        pipe_key(&self.service_id, self.pipe_type)
    }

    /// `start_date` from the service parameters, as RFC 3339 or `YYYY-MM-DD`.
    pub fn start_date(&self) -> Option<DateTime<Utc>> {
        let raw = self.service_params.get("start_date")?.as_str()?;
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Some(parsed.with_timezone(&Utc));
        }
        NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc())
    }
}

pub fn pipe_key(service_id: &str, pipe_type: PipeType) -> String {
    format!("{}:{}", service_id, pipe_type.as_str())
}

/// Split a pipe key back into service id and pipe type.
pub fn parse_pipe_key(key: &str) -> Result<(String, PipeType)> {
    let (service_id, pipe_id) = key
        .rsplit_once(':')
        .ok_or_else(|| SyncError::PersistenceFailed(format!("malformed pipe key '{}'", key)))?;
    Ok((service_id.to_string(), pipe_id.parse()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_pipe_type_round_trip() {
        for pipe_type in PipeType::ALL {
            assert_eq!(pipe_type.as_str().parse::<PipeType>().unwrap(), pipe_type);
        }
        assert!(matches!("invoices".parse::<PipeType>(), Err(SyncError::UnsupportedPipe(_))));
    }

    #[test]
    fn test_todos_share_task_entity() {
        assert_eq!(PipeType::Todos.entity(), EntityType::Tasks);
        assert_eq!(PipeType::Tasks.entity(), EntityType::Tasks);
        assert_eq!(PipeType::TodoLists.entity(), EntityType::TodoLists);
    }

    #[test]
    fn test_pipe_key() {
        let pipe = Pipe::new(1, "basecamp", PipeType::TodoLists);
        assert_eq!(pipe.key(), "basecamp:todolists");

        let (service, pipe_type) = parse_pipe_key("basecamp:todolists").unwrap();
        assert_eq!(service, "basecamp");
        assert_eq!(pipe_type, PipeType::TodoLists);
        assert!(parse_pipe_key("garbage").is_err());
    }

    #[test]
    fn test_start_date_formats() {
        let mut pipe = Pipe::new(1, "github", PipeType::TimeEntries);
        assert_eq!(pipe.start_date(), None);

        pipe.service_params = json!({"start_date": "2024-02-03"});
        assert_eq!(
            pipe.start_date(),
            Some(Utc.with_ymd_and_hms(2024, 2, 3, 0, 0, 0).unwrap())
        );

        pipe.service_params = json!({"start_date": "2024-02-03T10:00:00+02:00"});
        assert_eq!(
            pipe.start_date(),
            Some(Utc.with_ymd_and_hms(2024, 2, 3, 8, 0, 0).unwrap())
        );

        pipe.service_params = json!({"start_date": "last tuesday"});
        assert_eq!(pipe.start_date(), None);
    }

    #[test]
    fn test_users_selector_is_not_serialized() {
        let mut pipe = Pipe::new(1, "asana", PipeType::Users);
        pipe.users_selector = Some(UsersSelector {
            ids: vec!["1".to_string()],
            send_invites: true,
        });
        let value = serde_json::to_value(&pipe).unwrap();
        assert!(value.get("users_selector").is_none());
        assert_eq!(value["pipe_type"], "users");
    }
}

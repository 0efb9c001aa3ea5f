//! Wire and snapshot types exchanged with providers and the central service.
//!
//! Entities carry both sides of the mapping: `id` is the central-service id
//! (zero until imported) and `foreign_id` the provider's id. Foreign ids are
//! strings and may carry a `-<entity>` suffix when a provider reuses numeric
//! ids across entity kinds.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::pipe::EntityType;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(default)]
    pub id: i64,
    pub email: String,
    pub name: String,
    pub foreign_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub foreign_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub billable: bool,
    #[serde(rename = "cid", default)]
    pub client_id: i64,
    pub foreign_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_client_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(rename = "pid", default)]
    pub project_id: i64,
    pub foreign_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_project_id: Option<String>,
}

/// A central-service time entry on its way to a provider.
///
/// The `foreign_*` fields are filled in from reversed ID mappings before
/// export; zero means "not known to the provider".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeEntry {
    pub id: i64,
    #[serde(rename = "pid", default)]
    pub project_id: i64,
    #[serde(rename = "tid", default)]
    pub task_id: i64,
    #[serde(rename = "uid", default)]
    pub user_id: i64,
    #[serde(default)]
    pub billable: bool,
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub stop: Option<DateTime<Utc>>,
    #[serde(rename = "duration", default)]
    pub duration_in_seconds: i64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub foreign_id: i64,
    #[serde(default)]
    pub foreign_task_id: i64,
    #[serde(default)]
    pub foreign_user_id: i64,
    #[serde(default)]
    pub foreign_project_id: i64,
}

fn default_true() -> bool {
    true
}

/// A fetched provider snapshot persisted between the fetch and post phases.
///
/// `error` carries a provider-side failure recorded at fetch time; the post
/// phase surfaces it instead of posting.
pub trait ImportSnapshot: Serialize + DeserializeOwned + Send + Sync {
    const ENTITY: EntityType;

    fn error(&self) -> Option<&str>;

    fn with_error(message: String) -> Self;
}

macro_rules! snapshot {
    ($(#[$meta:meta])* $name:ident, $field:ident: $item:ty, $entity:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        pub struct $name {
            #[serde(default, skip_serializing_if = "Option::is_none")]
            pub error: Option<String>,
            #[serde(default)]
            pub $field: Vec<$item>,
        }

        impl ImportSnapshot for $name {
            const ENTITY: EntityType = $entity;

            fn error(&self) -> Option<&str> {
                self.error.as_deref()
            }

            fn with_error(message: String) -> Self {
                Self {
                    error: Some(message),
                    ..Self::default()
                }
            }
        }
    };
}

snapshot!(AccountsResponse, accounts: Account, EntityType::Accounts);
snapshot!(UsersResponse, users: User, EntityType::Users);
snapshot!(ClientsResponse, clients: Client, EntityType::Clients);
snapshot!(ProjectsResponse, projects: Project, EntityType::Projects);
snapshot!(TasksResponse, tasks: Task, EntityType::Tasks);
snapshot!(
    /// Todo lists are posted to the central service as tasks.
    TodoListsResponse,
    todo_lists: Task,
    EntityType::TodoLists
);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsersRequest {
    pub users: Vec<User>,
    pub send_invites: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub clients: Vec<Client>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectRequest {
    pub projects: Vec<Project>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub tasks: Vec<Task>,
}

/// Anything the central service returns from an import call.
pub trait ImportResult {
    /// `(foreign_id, central_id)` pairs to record in the ID mapping.
    fn mapped_ids(&self) -> Vec<(String, i64)>;

    fn notifications(&self) -> &[String];

    fn count(&self) -> usize;
}

macro_rules! import_result {
    ($name:ident, $field:ident: $item:ty) => {
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        pub struct $name {
            #[serde(default)]
            pub $field: Vec<$item>,
            #[serde(default)]
            pub notifications: Vec<String>,
        }

        impl ImportResult for $name {
            fn mapped_ids(&self) -> Vec<(String, i64)> {
                self.$field
                    .iter()
                    .map(|item| (item.foreign_id.clone(), item.id))
                    .collect()
            }

            fn notifications(&self) -> &[String] {
                &self.notifications
            }

            fn count(&self) -> usize {
                self.$field.len()
            }
        }
    };
}

import_result!(UsersImport, users: User);
import_result!(ClientsImport, clients: Client);
import_result!(ProjectsImport, projects: Project);
import_result!(TasksImport, tasks: Task);

impl TasksImport {
    /// Fold the result of one request slice into the accumulated import.
    pub fn merge(&mut self, other: TasksImport) {
        self.tasks.extend(other.tasks);
        self.notifications.extend(other.notifications);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_wire_format() {
        let task: Task = serde_json::from_value(json!({
            "name": "Write docs",
            "foreign_id": "42",
            "foreign_project_id": "7"
        }))
        .unwrap();

        assert!(task.active);
        assert_eq!(task.id, 0);
        assert_eq!(task.foreign_project_id.as_deref(), Some("7"));

        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["pid"], 0);
    }

    #[test]
    fn test_snapshot_error_round_trip() {
        let snapshot = ProjectsResponse::with_error("rate limited".to_string());
        assert_eq!(snapshot.error(), Some("rate limited"));

        let stored = serde_json::to_string(&snapshot).unwrap();
        let loaded: ProjectsResponse = serde_json::from_str(&stored).unwrap();
        assert_eq!(loaded.error(), Some("rate limited"));
        assert!(loaded.projects.is_empty());
    }

    #[test]
    fn test_import_mapped_ids() {
        let import = ClientsImport {
            clients: vec![
                Client {
                    id: 10,
                    name: "Acme".to_string(),
                    foreign_id: "c1".to_string(),
                },
                Client {
                    id: 11,
                    name: "Globex".to_string(),
                    foreign_id: "c2".to_string(),
                },
            ],
            notifications: vec!["Acme renamed".to_string()],
        };

        assert_eq!(
            import.mapped_ids(),
            vec![("c1".to_string(), 10), ("c2".to_string(), 11)]
        );
        assert_eq!(import.count(), 2);
    }

    #[test]
    fn test_tasks_import_merge() {
        let mut total = TasksImport::default();
        total.merge(TasksImport {
            tasks: vec![Task {
                id: 1,
                foreign_id: "a".to_string(),
                ..Task::default()
            }],
            notifications: vec!["one".to_string()],
        });
        total.merge(TasksImport {
            tasks: vec![Task {
                id: 2,
                foreign_id: "b".to_string(),
                ..Task::default()
            }],
            notifications: vec![],
        });

        assert_eq!(total.count(), 2);
        assert_eq!(total.notifications(), ["one".to_string()]);
    }
}

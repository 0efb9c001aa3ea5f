//! # Engine Events
//!
//! Side channel for hosts that want to watch the engine: pipe runs, queue
//! activity and token refreshes are broadcast on a `tokio::sync::broadcast`
//! channel. Nothing in the engine depends on anyone listening.
//!
//! ## Overview
//!
//! - [`EventBus::emit`] fails only when there are no subscribers, and
//!   publishers discard that error
//! - Subscribers that fall more than the buffer size behind get
//!   `RecvError::Lagged` and continue from the oldest retained event
//! - [`WorkspaceEvents`] narrows a subscription to one workspace
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, EventBus, SyncEvent};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let bus = EventBus::new(16);
//! let mut events = bus.subscribe_workspace(7);
//!
//! let _ = bus.emit(CoreEvent::Sync(SyncEvent::Started {
//!     workspace_id: 7,
//!     service_id: "github".to_string(),
//!     pipe_id: "projects".to_string(),
//! }));
//!
//! assert!(!events.recv().await.unwrap().is_failure());
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast::{self, error::RecvError, error::SendError, Receiver, Sender};

pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    Sync(SyncEvent),
    Queue(QueueEvent),
    Auth(AuthEvent),
}

impl CoreEvent {
    /// Workspace the event belongs to. Queue sweeps span all workspaces.
    pub fn workspace_id(&self) -> Option<i64> {
        match self {
            CoreEvent::Sync(SyncEvent::Started { workspace_id, .. })
            | CoreEvent::Sync(SyncEvent::Completed { workspace_id, .. })
            | CoreEvent::Sync(SyncEvent::Failed { workspace_id, .. })
            | CoreEvent::Queue(QueueEvent::Boosted { workspace_id, .. })
            | CoreEvent::Auth(AuthEvent::TokenRefreshed { workspace_id, .. })
            | CoreEvent::Auth(AuthEvent::RefreshFailed { workspace_id, .. }) => Some(*workspace_id),
            CoreEvent::Queue(QueueEvent::Scheduled { .. })
            | CoreEvent::Queue(QueueEvent::Dequeued { .. }) => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            CoreEvent::Sync(SyncEvent::Failed { .. })
                | CoreEvent::Auth(AuthEvent::RefreshFailed { .. })
        )
    }
}

/// Lifecycle of one pipe run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum SyncEvent {
    /// Emitted once the `running` status is persisted.
    Started {
        workspace_id: i64,
        service_id: String,
        pipe_id: String,
    },
    Completed {
        workspace_id: i64,
        service_id: String,
        pipe_id: String,
        /// Rendered counters, e.g. `["3 clients", "12 projects"]`.
        object_counts: Vec<String>,
    },
    Failed {
        workspace_id: i64,
        service_id: String,
        pipe_id: String,
        /// The message recorded on the status.
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum QueueEvent {
    /// The periodic sweep enqueued `count` automatic pipes.
    Scheduled { count: u64 },
    /// A run-now request moved a pipe to the front.
    Boosted {
        workspace_id: i64,
        service_id: String,
        pipe_id: String,
    },
    Dequeued { count: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum AuthEvent {
    TokenRefreshed {
        workspace_id: i64,
        service_id: String,
        /// Unix seconds, when the provider sent an expiry.
        expires_at: Option<i64>,
    },
    RefreshFailed {
        workspace_id: i64,
        service_id: String,
        message: String,
    },
}

/// Broadcast hub. Clones share one channel.
#[derive(Clone)]
pub struct EventBus {
    sender: Sender<CoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns how many subscribers got the event.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Events emitted from now on. Nothing is replayed.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    pub fn subscribe_workspace(&self, workspace_id: i64) -> WorkspaceEvents {
        WorkspaceEvents {
            workspace_id,
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Subscription that skips events of other workspaces and workspace-less
/// queue sweeps.
pub struct WorkspaceEvents {
    workspace_id: i64,
    receiver: Receiver<CoreEvent>,
}

impl WorkspaceEvents {
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if event.workspace_id() == Some(self.workspace_id) {
                return Ok(event);
            }
        }
    }
}

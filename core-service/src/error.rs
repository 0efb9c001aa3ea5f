use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Service initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Unknown service: {0}")]
    InvalidService(String),

    #[error("Unknown pipe {pipe_id} for service {service_id}")]
    InvalidPipe { service_id: String, pipe_id: String },

    #[error("Background runner is at capacity ({capacity} tasks)")]
    BackgroundCapacity { capacity: usize },

    #[error("Run did not start within {0:?}")]
    RunStartTimeout(Duration),

    #[error("Authentication error: {0}")]
    Auth(#[from] core_auth::AuthError),

    #[error("Sync error: {0}")]
    Sync(#[from] core_sync::SyncError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] core_runtime::Error),
}

impl ServiceError {
    /// Text safe to return to API callers.
    pub fn user_message(&self) -> String {
        match self {
            ServiceError::Sync(e) => e.user_message(),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;

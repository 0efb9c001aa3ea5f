use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("No authorization stored for workspace {workspace_id} and service {service_id}")]
    NotFound {
        workspace_id: i64,
        service_id: String,
    },

    #[error("Stored credentials are invalid: {0}")]
    InvalidToken(String),

    #[error("Token refresh failed: {0}")]
    TokenRefreshFailed(String),

    #[error("No refresh token stored for service {service_id}")]
    NoRefreshToken { service_id: String },

    #[error("No OAuth2 client configured for service {0}")]
    MissingClientConfig(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Operation timed out: {operation}")]
    OperationTimeout { operation: String },

    #[error("Authorization storage error: {0}")]
    Storage(String),
}

impl AuthError {
    /// `true` when the stored authorization could not be read at all,
    /// `false` when it was read but could not be refreshed.
    pub fn is_load_failure(&self) -> bool {
        matches!(
            self,
            AuthError::NotFound { .. } | AuthError::InvalidToken(_) | AuthError::Storage(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;

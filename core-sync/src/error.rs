use bridge_traits::BridgeError;
use core_auth::AuthError;
use thiserror::Error;

/// Message shown to users when a central-service response cannot be decoded.
pub const RESPONSE_DECODE_MESSAGE: &str = "failed to parse response";

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Pipe {pipe_id} of service {service_id} is not configured")]
    NotConfigured { service_id: String, pipe_id: String },

    #[error("Invalid service parameters: {0}")]
    ParamsInvalid(String),

    #[error("Failed to load authorization: {0}")]
    AuthLoadFailed(String),

    #[error("Failed to refresh authorization: {0}")]
    AuthRefreshFailed(String),

    #[error("Upstream call failed: {0}")]
    UpstreamCallFailed(String),

    #[error("Persistence failed: {0}")]
    PersistenceFailed(String),

    #[error("Unsupported service: {0}")]
    UnsupportedService(String),

    #[error("Unsupported pipe: {0}")]
    UnsupportedPipe(String),

    #[error("No {entity} import found, the fetch phase has not run")]
    MissingImport { entity: String },

    #[error("{entity} must be synchronized before time entries")]
    MissingIdMappings { entity: String },

    #[error("Failed to decode response: {0}")]
    ResponseDecode(String),

    #[error("A single record exceeds the {limit} byte request limit")]
    PayloadTooLarge { limit: usize },

    #[error("Duplicate entry: {0}")]
    DuplicateEntry(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),
}

impl SyncError {
    /// Text recorded on a pipe status and shown to end users.
    ///
    /// Decode failures are masked; the full error still goes to logs and the
    /// error sink through `Display`.
    pub fn user_message(&self) -> String {
        match self {
            SyncError::ResponseDecode(_) => RESPONSE_DECODE_MESSAGE.to_string(),
            other => other.to_string(),
        }
    }

    /// Duplicate-key races are expected while enqueuing and are not failures.
    pub fn is_duplicate_entry(&self) -> bool {
        matches!(self, SyncError::DuplicateEntry(_))
    }

    /// Map a storage error, keeping unique-constraint violations distinguishable.
    pub fn from_sqlx(error: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &error {
            if db.is_unique_violation() {
                return SyncError::DuplicateEntry(db.message().to_string());
            }
        }
        SyncError::PersistenceFailed(error.to_string())
    }

    pub(crate) fn json(error: serde_json::Error) -> Self {
        SyncError::PersistenceFailed(format!("invalid stored document: {}", error))
    }
}

impl From<AuthError> for SyncError {
    fn from(error: AuthError) -> Self {
        if error.is_load_failure() {
            SyncError::AuthLoadFailed(error.to_string())
        } else {
            SyncError::AuthRefreshFailed(error.to_string())
        }
    }
}

impl From<BridgeError> for SyncError {
    fn from(error: BridgeError) -> Self {
        match error {
            BridgeError::Timeout(after) => SyncError::Timeout(format!("request after {:?}", after)),
            other => SyncError::UpstreamCallFailed(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

use std::time::Duration;

use thiserror::Error;

/// Failures raised by host capabilities.
///
/// Non-2xx HTTP statuses are not errors at this layer; they come back as
/// responses and callers decide what they mean.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Host capability unavailable: {0}")]
    NotAvailable(String),

    #[error("Transport failure: {0}")]
    OperationFailed(String),

    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error("Connection refused or reset: {0}")]
    Connection(String),
}

impl BridgeError {
    /// Whether the same request may succeed if sent again.
    pub fn is_transient(&self) -> bool {
        matches!(self, BridgeError::Timeout(_) | BridgeError::Connection(_))
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

use bridge_traits::BridgeError;
use thiserror::Error;

/// Failures while assembling the runtime, before any pipe runs.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("No {capability} available: {message}")]
    CapabilityMissing { capability: String, message: String },

    #[error("Cannot install log subscriber: {0}")]
    Logging(String),

    #[error("Host bridge failed: {0}")]
    Bridge(#[from] BridgeError),
}

pub type Result<T> = std::result::Result<T, Error>;

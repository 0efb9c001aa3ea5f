//! # Core Runtime Module
//!
//! Foundational runtime infrastructure shared by the synchronization crates:
//! - Logging and tracing bootstrap
//! - Configuration management ([`PipesConfig`](config::PipesConfig))
//! - Event bus for run, queue and authorization events
//! - Default error sink ([`TracingErrorReporter`](report::TracingErrorReporter))

pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod report;

pub use error::{Error, Result};

//! Error Reporting Sink
//!
//! The engine never decides where failures end up. Every unrecovered run error,
//! queue scheduling failure or background import failure is handed to an
//! [`ErrorReporter`], which the host wires to its telemetry backend.

use std::collections::BTreeMap;

/// A single failure report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorReport {
    /// Short description of the failing operation (e.g. `"synchronize"`).
    pub operation: String,
    /// Rendered error message, including internal detail.
    pub message: String,
    pub workspace_id: Option<i64>,
    pub service_id: Option<String>,
    pub pipe_id: Option<String>,
    /// Extra context fields.
    pub context: BTreeMap<String, String>,
}

impl ErrorReport {
    pub fn new(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_workspace(mut self, workspace_id: i64) -> Self {
        self.workspace_id = Some(workspace_id);
        self
    }

    pub fn with_service(mut self, service_id: impl Into<String>) -> Self {
        self.service_id = Some(service_id.into());
        self
    }

    pub fn with_pipe(mut self, pipe_id: impl Into<String>) -> Self {
        self.pipe_id = Some(pipe_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error/telemetry sink.
///
/// Implementations must not block; forward to a channel or spawn if the
/// backend is slow.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, report: ErrorReport);
}

/// Reporter that drops everything. Useful when the host has no sink configured.
#[derive(Debug, Clone, Default)]
pub struct NoopReporter;

impl ErrorReporter for NoopReporter {
    fn report(&self, _report: ErrorReport) {}
}

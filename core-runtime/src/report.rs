//! Default error sink that turns reports into `tracing` events.

use bridge_traits::report::{ErrorReport, ErrorReporter};
use tracing::error;

use crate::logging::redact_if_sensitive;

/// Emits every [`ErrorReport`] as an `error!` event, with credential-like
/// context values masked.
///
/// Hosts with a real telemetry backend replace this through
/// [`PipesConfigBuilder::error_reporter`](crate::config::PipesConfigBuilder::error_reporter).
#[derive(Debug, Clone, Default)]
pub struct TracingErrorReporter;

impl ErrorReporter for TracingErrorReporter {
    fn report(&self, report: ErrorReport) {
        let context = report
            .context
            .iter()
            .map(|(k, v)| format!("{}={}", k, redact_if_sensitive(k, v)))
            .collect::<Vec<_>>()
            .join(" ");

        error!(
            operation = %report.operation,
            workspace_id = ?report.workspace_id,
            service_id = report.service_id.as_deref().unwrap_or("-"),
            pipe_id = report.pipe_id.as_deref().unwrap_or("-"),
            context = %context,
            "{}",
            report.message
        );
    }
}

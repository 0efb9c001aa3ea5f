//! # Logging
//!
//! One-shot `tracing-subscriber` bootstrap for hosts embedding the engine.
//!
//! ## Overview
//!
//! Every engine log line carries `workspace_id`, `service_id` and `pipe_id`
//! fields where they apply, so the JSON format is the one to pick for log
//! aggregation. The default filter raises the workspace crates to the
//! configured level and keeps HTTP and SQL internals at `warn`.
//!
//! ```ignore
//! use core_runtime::logging::{init_logging, LogFormat, LoggingConfig};
//!
//! init_logging(
//!     LoggingConfig::default()
//!         .with_format(LogFormat::Json)
//!         .with_filter("core_sync=debug,sqlx=info"),
//! )?;
//! ```

use crate::error::{Error, Result};

use std::str::FromStr;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{
    filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt, Layer, Registry,
};

const ENGINE_CRATES: [&str; 6] = [
    "pipes_workspace",
    "core_runtime",
    "core_auth",
    "core_sync",
    "core_service",
    "bridge_desktop",
];

const QUIET_DEPENDENCIES: [&str; 5] = ["h2", "hyper", "reqwest", "rustls", "sqlx"];

/// Key fragments whose values never reach a log line.
const SECRET_MARKERS: [&str; 7] = [
    "token",
    "secret",
    "password",
    "authorization",
    "api_key",
    "credential",
    "bearer",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
    Compact,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            "compact" => Ok(LogFormat::Compact),
            other => Err(Error::Config(format!("Unknown log format '{}'", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Level for the engine crates when no custom filter is set.
    pub level: LevelFilter,
    /// Full `EnvFilter` directive string. Replaces the default filter.
    pub filter: Option<String>,
    /// Log span open/close, useful to time pipe runs.
    pub spans: bool,
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: if cfg!(debug_assertions) {
                LogFormat::Pretty
            } else {
                LogFormat::Json
            },
            level: LevelFilter::INFO,
            filter: None,
            spans: false,
            ansi: cfg!(debug_assertions),
        }
    }
}

impl LoggingConfig {
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_level(mut self, level: LevelFilter) -> Self {
        self.level = level;
        self
    }

    pub fn with_filter(mut self, directives: impl Into<String>) -> Self {
        self.filter = Some(directives.into());
        self
    }

    pub fn with_spans(mut self, spans: bool) -> Self {
        self.spans = spans;
        self
    }

    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi = ansi;
        self
    }

    fn directives(&self) -> String {
        if let Some(custom) = &self.filter {
            return custom.clone();
        }

        let level = self.level.to_string().to_lowercase();
        ENGINE_CRATES
            .iter()
            .map(|target| format!("{}={}", target, level))
            .chain(QUIET_DEPENDENCIES.iter().map(|target| format!("{}=warn", target)))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn env_filter(&self) -> Result<EnvFilter> {
        EnvFilter::try_new(self.directives())
            .map_err(|e| Error::Config(format!("Invalid log filter: {}", e)))
    }
}

/// Install the global subscriber.
///
/// # Errors
///
/// [`Error::Config`] for an unparsable filter, [`Error::Logging`] when a
/// global subscriber is already installed.
pub fn init_logging(config: LoggingConfig) -> Result<()> {
    let filter = config.env_filter()?;
    let span_events = if config.spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let output: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(config.spans)
            .with_span_list(false)
            .with_span_events(span_events)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .pretty()
            .with_ansi(config.ansi)
            .with_span_events(span_events)
            .boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .compact()
            .with_ansi(config.ansi)
            .with_span_events(span_events)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(output)
        .with(filter)
        .try_init()
        .map_err(|e| Error::Logging(e.to_string()))
}

/// Mask `value` when `key` names a credential, and hide the local part of
/// e-mail addresses otherwise.
pub fn redact_if_sensitive(key: &str, value: &str) -> String {
    let key = key.to_ascii_lowercase();
    if SECRET_MARKERS.iter().any(|marker| key.contains(marker)) {
        return "[REDACTED]".to_string();
    }

    match value.split_once('@') {
        Some((local, domain)) if domain.contains('.') => match local.chars().next() {
            Some(first) => format!("{}***@{}", first, domain),
            None => value.to_string(),
        },
        _ => value.to_string(),
    }
}

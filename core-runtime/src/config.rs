//! # Pipes Configuration Module
//!
//! Provides configuration management for the synchronization engine.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a [`PipesConfig`]
//! holding every setting and host capability the engine needs. Validation is
//! fail-fast: `build()` refuses a configuration that would only break later at
//! the first scheduled run.
//!
//! ## Required Settings
//!
//! - `database_url` - SQLite connection string for pipes, statuses, mappings and the queue
//! - `central_api_url` - Base URL of the central time-tracking service
//!
//! ## Optional Dependencies (with defaults)
//!
//! - `HttpClient` - desktop default: `bridge_desktop::ReqwestHttpClient` (`desktop-shims` feature)
//! - `Clock` - default: [`SystemClock`]
//! - `ErrorReporter` - default: [`TracingErrorReporter`]
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::{PipesConfig, IntegrationConfig};
//!
//! let config = PipesConfig::builder()
//!     .database_url("sqlite://pipes.db")
//!     .central_api_url("https://track.example.com")
//!     .host_url("https://pipes.example.com")
//!     .workers(15)
//!     .integration(IntegrationConfig::new("github", "GitHub", "oauth2").with_pipes(["projects"]))
//!     .build()?;
//! ```
//!
//! ## Error Handling
//!
//! ```should_panic
//! use core_runtime::config::PipesConfig;
//!
//! // Missing central API URL
//! let config = PipesConfig::builder()
//!     .database_url("sqlite::memory:")
//!     .build()
//!     .expect("Should fail - central_api_url is required");
//! ```

use crate::error::{Error, Result};
use crate::report::TracingErrorReporter;
use bridge_traits::{Clock, ErrorReporter, HttpClient, SystemClock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default number of concurrent queue workers.
pub const DEFAULT_WORKERS: usize = 15;

/// A base interval plus a random jitter of up to `jitter`.
///
/// Loops sleep `base + rand(0..=jitter)` so that several processes polling the
/// same database do not wake up in lockstep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JitteredInterval {
    pub base: Duration,
    pub jitter: Duration,
}

impl JitteredInterval {
    pub const fn new(base: Duration, jitter: Duration) -> Self {
        Self { base, jitter }
    }

    /// Draw the next sleep duration.
    pub fn sample(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.base;
        }
        let extra = rand::thread_rng().gen_range(0..=jitter_ms);
        self.base + Duration::from_millis(extra)
    }

    /// Upper bound of [`sample`](Self::sample).
    pub fn max(&self) -> Duration {
        self.base + self.jitter
    }
}

/// OAuth2 client credentials for one provider.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OAuth2ClientSettings {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
}

impl fmt::Debug for OAuth2ClientSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuth2ClientSettings")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("token_url", &self.token_url)
            .finish()
    }
}

/// One entry of the static integration catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrationConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub link: String,
    #[serde(default)]
    pub image: String,
    /// `"oauth1"` or `"oauth2"`.
    pub auth_type: String,
    /// Pipe ids supported by this integration (`"users"`, `"projects"`, ...).
    #[serde(default)]
    pub pipes: Vec<String>,
}

impl IntegrationConfig {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        auth_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            link: String::new(),
            image: String::new(),
            auth_type: auth_type.into(),
            pipes: Vec::new(),
        }
    }

    pub fn with_pipes<I, S>(mut self, pipes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pipes = pipes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = link.into();
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }
}

/// Configuration for the Pipes synchronization engine.
///
/// Use [`PipesConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct PipesConfig {
    /// SQLite connection string
    pub database_url: String,

    /// Base URL of the central time-tracking service API
    pub central_api_url: String,

    /// Public base URL used when rendering `sync_log` links
    pub host_url: String,

    /// Number of concurrent queue workers per drain cycle
    pub workers: usize,

    /// Sleep between automatic enqueue sweeps
    pub auto_enqueue_interval: JitteredInterval,

    /// Sleep between drain cycles
    pub drain_interval: JitteredInterval,

    /// Sleep of an idle worker before re-polling the queue
    pub idle_backoff: JitteredInterval,

    /// Empty polls after which a worker returns
    pub idle_retries: u32,

    /// Maximum number of queue entries locked by a single dequeue
    pub queue_batch_size: usize,

    /// Locked-but-unsynced queue entries older than this are released
    pub stale_lock_timeout: Duration,

    /// Timeout applied to every outbound sync/OAuth request
    pub request_timeout: Duration,

    /// Timeout applied to readiness probes
    pub health_check_timeout: Duration,

    /// How long a Users run-now caller waits for the run to start
    pub run_start_timeout: Duration,

    /// Concurrent background imports
    pub background_capacity: usize,

    /// Event bus buffer size
    pub event_buffer_size: usize,

    /// OAuth2 client credentials keyed by service id
    pub oauth2_clients: HashMap<String, OAuth2ClientSettings>,

    /// Static integration catalog
    pub integrations: Vec<IntegrationConfig>,

    /// HTTP client for central service and OAuth calls
    pub http_client: Arc<dyn HttpClient>,

    /// Time source
    pub clock: Arc<dyn Clock>,

    /// Error/telemetry sink
    pub error_reporter: Arc<dyn ErrorReporter>,
}

impl PipesConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> PipesConfigBuilder {
        PipesConfigBuilder::default()
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - Required URLs are present and look like URLs
    /// - Worker, batch and capacity counts are non-zero
    /// - Every integration declares a known authorization type
    /// - OAuth2 integrations have client credentials
    pub fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            return Err(Error::Config("Database URL cannot be empty".to_string()));
        }

        if !is_http_url(&self.central_api_url) {
            return Err(Error::Config(format!(
                "Central API URL must be an http(s) URL, got '{}'",
                self.central_api_url
            )));
        }

        if self.workers == 0 {
            return Err(Error::Config("Worker count must be greater than 0".to_string()));
        }

        if self.queue_batch_size == 0 {
            return Err(Error::Config(
                "Queue batch size must be greater than 0".to_string(),
            ));
        }

        if self.background_capacity == 0 {
            return Err(Error::Config(
                "Background capacity must be greater than 0".to_string(),
            ));
        }

        if self.request_timeout.is_zero() || self.health_check_timeout.is_zero() {
            return Err(Error::Config("Timeouts must be greater than zero".to_string()));
        }

        for integration in &self.integrations {
            match integration.auth_type.as_str() {
                "oauth1" => {}
                "oauth2" => {
                    if !self.oauth2_clients.contains_key(&integration.id) {
                        return Err(Error::Config(format!(
                            "Integration '{}' uses oauth2 but has no client credentials. \
                             Use .oauth2_client() to register them.",
                            integration.id
                        )));
                    }
                }
                other => {
                    return Err(Error::Config(format!(
                        "Integration '{}' has unknown auth type '{}'",
                        integration.id, other
                    )));
                }
            }
        }

        Ok(())
    }
}

impl fmt::Debug for PipesConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipesConfig")
            .field("database_url", &self.database_url)
            .field("central_api_url", &self.central_api_url)
            .field("host_url", &self.host_url)
            .field("workers", &self.workers)
            .field("auto_enqueue_interval", &self.auto_enqueue_interval)
            .field("drain_interval", &self.drain_interval)
            .field("idle_retries", &self.idle_retries)
            .field("queue_batch_size", &self.queue_batch_size)
            .field("request_timeout", &self.request_timeout)
            .field("oauth2_clients", &self.oauth2_clients)
            .field("integrations", &self.integrations.len())
            .finish_non_exhaustive()
    }
}

fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

#[cfg(feature = "desktop-shims")]
fn provide_default_http_client(timeout: Duration) -> Result<Arc<dyn HttpClient>> {
    use bridge_desktop::ReqwestHttpClient;

    let client: Arc<dyn HttpClient> = Arc::new(ReqwestHttpClient::with_timeout(timeout)?);
    Ok(client)
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_http_client(_timeout: Duration) -> Result<Arc<dyn HttpClient>> {
    Err(Error::CapabilityMissing {
        capability: "HttpClient".to_string(),
        message: "An HttpClient implementation is required for central service and OAuth calls. \
                 Enable the 'desktop-shims' feature to use the default ReqwestHttpClient \
                 or inject one with .http_client()."
            .to_string(),
    })
}

/// Builder for constructing [`PipesConfig`] instances.
#[derive(Default)]
pub struct PipesConfigBuilder {
    database_url: Option<String>,
    central_api_url: Option<String>,
    host_url: Option<String>,
    workers: Option<usize>,
    auto_enqueue_interval: Option<JitteredInterval>,
    drain_interval: Option<JitteredInterval>,
    idle_backoff: Option<JitteredInterval>,
    idle_retries: Option<u32>,
    queue_batch_size: Option<usize>,
    stale_lock_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
    health_check_timeout: Option<Duration>,
    run_start_timeout: Option<Duration>,
    background_capacity: Option<usize>,
    event_buffer_size: Option<usize>,
    oauth2_clients: HashMap<String, OAuth2ClientSettings>,
    integrations: Vec<IntegrationConfig>,
    http_client: Option<Arc<dyn HttpClient>>,
    clock: Option<Arc<dyn Clock>>,
    error_reporter: Option<Arc<dyn ErrorReporter>>,
}

impl PipesConfigBuilder {
    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn central_api_url(mut self, url: impl Into<String>) -> Self {
        self.central_api_url = Some(url.into());
        self
    }

    pub fn host_url(mut self, url: impl Into<String>) -> Self {
        self.host_url = Some(url.into());
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn auto_enqueue_interval(mut self, interval: JitteredInterval) -> Self {
        self.auto_enqueue_interval = Some(interval);
        self
    }

    pub fn drain_interval(mut self, interval: JitteredInterval) -> Self {
        self.drain_interval = Some(interval);
        self
    }

    pub fn idle_backoff(mut self, interval: JitteredInterval) -> Self {
        self.idle_backoff = Some(interval);
        self
    }

    pub fn idle_retries(mut self, retries: u32) -> Self {
        self.idle_retries = Some(retries);
        self
    }

    pub fn queue_batch_size(mut self, size: usize) -> Self {
        self.queue_batch_size = Some(size);
        self
    }

    pub fn stale_lock_timeout(mut self, timeout: Duration) -> Self {
        self.stale_lock_timeout = Some(timeout);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn health_check_timeout(mut self, timeout: Duration) -> Self {
        self.health_check_timeout = Some(timeout);
        self
    }

    pub fn run_start_timeout(mut self, timeout: Duration) -> Self {
        self.run_start_timeout = Some(timeout);
        self
    }

    pub fn background_capacity(mut self, capacity: usize) -> Self {
        self.background_capacity = Some(capacity);
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = Some(size);
        self
    }

    /// Registers OAuth2 client credentials for a service.
    pub fn oauth2_client(
        mut self,
        service_id: impl Into<String>,
        settings: OAuth2ClientSettings,
    ) -> Self {
        self.oauth2_clients.insert(service_id.into(), settings);
        self
    }

    /// Adds an entry to the integration catalog.
    pub fn integration(mut self, integration: IntegrationConfig) -> Self {
        self.integrations.push(integration);
        self
    }

    pub fn integrations(mut self, integrations: Vec<IntegrationConfig>) -> Self {
        self.integrations.extend(integrations);
        self
    }

    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn error_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.error_reporter = Some(reporter);
        self
    }

    /// Builds the configuration, applying defaults and validating the result.
    pub fn build(self) -> Result<PipesConfig> {
        let database_url = self.database_url.ok_or_else(|| {
            Error::Config("Database URL is required. Use .database_url() to set it.".to_string())
        })?;

        let central_api_url = self.central_api_url.ok_or_else(|| {
            Error::Config(
                "Central API URL is required. Use .central_api_url() to set it.".to_string(),
            )
        })?;

        let request_timeout = self.request_timeout.unwrap_or(Duration::from_secs(60));

        let http_client = match self.http_client {
            Some(client) => client,
            None => provide_default_http_client(request_timeout)?,
        };

        let config = PipesConfig {
            database_url,
            central_api_url: central_api_url.trim_end_matches('/').to_string(),
            host_url: self
                .host_url
                .unwrap_or_default()
                .trim_end_matches('/')
                .to_string(),
            workers: self.workers.unwrap_or(DEFAULT_WORKERS),
            auto_enqueue_interval: self.auto_enqueue_interval.unwrap_or(JitteredInterval::new(
                Duration::from_secs(60 * 60),
                Duration::from_secs(15 * 60),
            )),
            drain_interval: self.drain_interval.unwrap_or(JitteredInterval::new(
                Duration::from_secs(15),
                Duration::from_secs(15),
            )),
            idle_backoff: self.idle_backoff.unwrap_or(JitteredInterval::new(
                Duration::from_secs(1),
                Duration::from_secs(2),
            )),
            idle_retries: self.idle_retries.unwrap_or(3),
            queue_batch_size: self.queue_batch_size.unwrap_or(10),
            stale_lock_timeout: self
                .stale_lock_timeout
                .unwrap_or(Duration::from_secs(2 * 60 * 60)),
            request_timeout,
            health_check_timeout: self.health_check_timeout.unwrap_or(Duration::from_secs(5)),
            run_start_timeout: self.run_start_timeout.unwrap_or(Duration::from_secs(5)),
            background_capacity: self.background_capacity.unwrap_or(32),
            event_buffer_size: self
                .event_buffer_size
                .unwrap_or(crate::events::DEFAULT_EVENT_BUFFER_SIZE),
            oauth2_clients: self.oauth2_clients,
            integrations: self.integrations,
            http_client,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            error_reporter: self
                .error_reporter
                .unwrap_or_else(|| Arc::new(TracingErrorReporter)),
        };

        config.validate()?;

        Ok(config)
    }
}

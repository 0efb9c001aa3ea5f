//! # HTTP Bridge
//!
//! The engine talks to two kinds of remote endpoints: the central time-tracking
//! API and OAuth2 token endpoints of connected providers. Both go through the
//! [`HttpClient`] trait so hosts can plug in their own transport and tests can
//! mock it.
//!
//! ## Overview
//!
//! - [`HttpRequest`] is a plain value built with chained setters
//! - [`HttpResponse`] carries the raw body; decoding happens at the call site
//! - [`Backoff`] describes how a transport spaces out retries of
//!   [`HttpResponse::is_retryable`] responses

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{BridgeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }

    /// Whether repeating the request cannot create duplicates upstream.
    ///
    /// Batch posts to the central service are not idempotent: a retried POST
    /// may create the same entities twice.
    pub fn is_idempotent(&self) -> bool {
        matches!(self, HttpMethod::Get | HttpMethod::Put | HttpMethod::Delete)
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Bytes>,
    /// Overrides the transport's default timeout when set.
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HashMap::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Basic credentials. The central service takes its API token as the
    /// user name with the literal password `api_token`.
    pub fn basic_auth(self, user: &str, password: &str) -> Self {
        let credentials = STANDARD.encode(format!("{}:{}", user, password));
        self.header("Authorization", format!("Basic {}", credentials))
    }

    pub fn json<T: Serialize + ?Sized>(mut self, payload: &T) -> Result<Self> {
        let encoded = serde_json::to_vec(payload)
            .map_err(|e| BridgeError::OperationFailed(format!("Cannot encode JSON body: {}", e)))?;
        self.body = Some(Bytes::from(encoded));
        Ok(self.header("Content-Type", "application/json"))
    }

    /// `application/x-www-form-urlencoded` body, as token endpoints expect.
    pub fn form<T: Serialize + ?Sized>(mut self, fields: &T) -> Result<Self> {
        let encoded = serde_urlencoded::to_string(fields)
            .map_err(|e| BridgeError::OperationFailed(format!("Cannot encode form body: {}", e)))?;
        self.body = Some(Bytes::from(encoded));
        Ok(self.header("Content-Type", "application/x-www-form-urlencoded"))
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Header lookup ignoring ASCII case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| BridgeError::OperationFailed(format!("Cannot decode JSON body: {}", e)))
    }

    pub fn text(&self) -> Result<String> {
        std::str::from_utf8(&self.body)
            .map(str::to_owned)
            .map_err(|e| BridgeError::OperationFailed(format!("Body is not UTF-8: {}", e)))
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 4xx other than 429. Repeating the request will not help.
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status) && self.status != 429
    }

    /// 5xx or 429.
    pub fn is_retryable(&self) -> bool {
        self.status >= 500 || self.status == 429
    }

    /// `Retry-After` in seconds, if the server sent one.
    pub fn retry_after(&self) -> Option<Duration> {
        self.header("Retry-After")
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }
}

/// Exponential retry spacing.
///
/// `attempts` counts the first try, so `attempts == 1` never retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Backoff {
    pub fn none() -> Self {
        Self {
            attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based), capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn allows_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.attempts
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Transport for outgoing requests.
///
/// Implementations apply [`HttpRequest::timeout`] (or their own default) and
/// return non-2xx responses as `Ok`; only transport failures are errors.
///
/// ```ignore
/// let request = HttpRequest::new(HttpMethod::Get, format!("{}/api/status", base_url))
///     .timeout(Duration::from_secs(5));
/// let healthy = client.execute(request).await?.is_success();
/// ```
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;
}

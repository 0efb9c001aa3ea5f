//! reqwest-backed [`HttpClient`].

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    http::{Backoff, HttpClient, HttpMethod, HttpRequest, HttpResponse},
};
use reqwest::Client;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Default per-request timeout for sync traffic.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Pooled HTTP transport.
///
/// Idempotent requests are retried on transient transport errors and on
/// retryable statuses (5xx, 429) according to [`Backoff`]. POST and PATCH go
/// out exactly once. When retries run out the last response is returned as is
/// so callers see the real status.
pub struct ReqwestHttpClient {
    client: Client,
    default_timeout: Duration,
    backoff: Backoff,
}

impl ReqwestHttpClient {
    pub fn new() -> Result<Self> {
        Self::with_timeout(DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_max_idle_per_host(10)
            .user_agent(concat!("pipes-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BridgeError::NotAvailable(format!("Cannot build HTTP client: {}", e)))?;

        Ok(Self::with_client(client, timeout))
    }

    pub fn with_client(client: Client, default_timeout: Duration) -> Self {
        Self {
            client,
            default_timeout,
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    fn backoff_for(&self, method: HttpMethod) -> Backoff {
        if method.is_idempotent() {
            self.backoff
        } else {
            Backoff::none()
        }
    }

    async fn send_once(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let timeout = request.timeout.unwrap_or(self.default_timeout);
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| BridgeError::OperationFailed(e.to_string()))?;

        let mut builder = self.client.request(method, &request.url).timeout(timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| classify(e, timeout))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(|e| classify(e, timeout))?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

fn classify(error: reqwest::Error, timeout: Duration) -> BridgeError {
    if error.is_timeout() {
        BridgeError::Timeout(timeout)
    } else if error.is_connect() {
        BridgeError::Connection(error.to_string())
    } else {
        BridgeError::OperationFailed(error.to_string())
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let backoff = self.backoff_for(request.method);
        let mut attempts = 0;

        loop {
            attempts += 1;
            debug!(
                method = request.method.as_str(),
                url = %request.url,
                attempts,
                "Sending request"
            );

            let wait = match self.send_once(&request).await {
                Ok(response) if response.is_retryable() && backoff.allows_retry(attempts) => {
                    warn!(
                        status = response.status,
                        attempts,
                        url = %request.url,
                        "Retryable status"
                    );
                    response
                        .retry_after()
                        .map(|hint| hint.min(backoff.max_delay))
                        .unwrap_or_else(|| backoff.delay_for(attempts))
                }
                Err(e) if e.is_transient() && backoff.allows_retry(attempts) => {
                    warn!(error = %e, attempts, url = %request.url, "Transient transport failure");
                    backoff.delay_for(attempts)
                }
                outcome => return outcome,
            };

            sleep(wait).await;
        }
    }
}

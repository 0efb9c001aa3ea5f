//! OAuth2 token refresh client.
//!
//! Interactive authorization (OAuth1 exchange, OAuth2 code flow) happens outside
//! the engine. What remains here is the refresh-token grant used when a stored
//! OAuth2 token has expired.

use crate::error::{AuthError, Result};
use crate::types::OAuth2Token;
use bridge_traits::http::{Backoff, HttpClient, HttpMethod, HttpRequest};
use bridge_traits::time::Clock;
use core_runtime::config::OAuth2ClientSettings;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

const REFRESH_BACKOFF: Backoff = Backoff {
    attempts: 3,
    initial_delay: Duration::from_millis(100),
    max_delay: Duration::from_secs(2),
};

/// Refresh-token client for a single provider.
pub struct OAuth2Client {
    service_id: String,
    settings: OAuth2ClientSettings,
    http_client: Arc<dyn HttpClient>,
    clock: Arc<dyn Clock>,
    request_timeout: Duration,
}

impl OAuth2Client {
    pub fn new(
        service_id: impl Into<String>,
        settings: OAuth2ClientSettings,
        http_client: Arc<dyn HttpClient>,
        clock: Arc<dyn Clock>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            settings,
            http_client,
            clock,
            request_timeout,
        }
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Exchange the refresh token of `token` for a new access token.
    ///
    /// Retries 5xx and 429 responses with backoff; other 4xx responses (revoked or
    /// invalid refresh token) fail immediately. Providers that do not rotate
    /// refresh tokens keep the previous one.
    #[instrument(skip(self, token), fields(service_id = %self.service_id))]
    pub async fn refresh(&self, token: &OAuth2Token) -> Result<OAuth2Token> {
        let refresh_token = token
            .refresh_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AuthError::NoRefreshToken {
                service_id: self.service_id.clone(),
            })?;

        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.settings.client_id.as_str()),
            ("client_secret", self.settings.client_secret.as_str()),
        ];
        let request = HttpRequest::new(HttpMethod::Post, self.settings.token_url.clone())
            .header("Accept", "application/json")
            .timeout(self.request_timeout)
            .form(&params)
            .map_err(|e| {
                AuthError::TokenRefreshFailed(format!("Failed to encode token request: {}", e))
            })?;

        debug!("Refreshing access token");

        let mut attempts = 0;
        loop {
            attempts += 1;

            let response = self
                .http_client
                .execute(request.clone())
                .await
                .map_err(|e| AuthError::NetworkError(e.to_string()))?;

            if response.is_success() {
                let token_response: TokenResponse = response.json().map_err(|e| {
                    AuthError::TokenRefreshFailed(format!("Failed to parse token response: {}", e))
                })?;

                info!(
                    expires_in = ?token_response.expires_in,
                    "Successfully refreshed token"
                );

                return Ok(OAuth2Token {
                    access_token: token_response.access_token,
                    token_type: token_response.token_type.or_else(|| token.token_type.clone()),
                    refresh_token: token_response
                        .refresh_token
                        .or_else(|| Some(refresh_token.to_string())),
                    expires_at: token_response
                        .expires_in
                        .filter(|secs| *secs > 0)
                        .map(|secs| self.clock.now() + chrono::Duration::seconds(secs)),
                });
            }

            let status = response.status;
            let error_body = response
                .text()
                .unwrap_or_else(|_| "Unable to read error response".to_string());

            if response.is_client_error() {
                warn!(
                    status = status,
                    error = %error_body,
                    "Token refresh failed without retry"
                );

                return Err(AuthError::TokenRefreshFailed(format!(
                    "Token endpoint returned {}: {}",
                    status, error_body
                )));
            }

            if !REFRESH_BACKOFF.allows_retry(attempts) {
                return Err(AuthError::TokenRefreshFailed(format!(
                    "Token refresh failed after {} attempts. Last error: {} - {}",
                    attempts, status, error_body
                )));
            }

            let delay = REFRESH_BACKOFF.delay_for(attempts);
            warn!(
                status = status,
                attempts = attempts,
                delay_ms = delay.as_millis(),
                "Token refresh failed, retrying"
            );
            sleep(delay).await;
        }
    }
}

/// Token response from the OAuth provider.
#[derive(Debug, Deserialize, Serialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_in: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token_type: Option<String>,
}

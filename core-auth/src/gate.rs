//! # Authorization Gate
//!
//! Resolves the credentials a pipe run needs before any provider call is made.
//!
//! ## Overview
//!
//! 1. Load the stored [`Authorization`] for `(workspace, service)`.
//! 2. OAuth1 credentials are returned untouched (no refresh step exists).
//! 3. OAuth2 credentials are decoded; an expired token is refreshed with the
//!    service's [`OAuth2Client`], written back into the blob and persisted
//!    before the authorization is handed to the caller.
//!
//! A refresh failure surfaces as an [`AuthError`] for which
//! [`AuthError::is_load_failure`] is `false`, so callers can tell "never
//! connected" apart from "connected but the provider rejected the refresh".

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bridge_traits::{Clock, HttpClient};
use core_runtime::config::PipesConfig;
use core_runtime::events::{AuthEvent, CoreEvent, EventBus};
use tokio::time::timeout;
use tracing::{debug, error, info, instrument};

use crate::error::{AuthError, Result};
use crate::oauth::OAuth2Client;
use crate::store::AuthorizationStore;
use crate::types::{Authorization, AuthorizationType, WorkspaceId};

/// Upper bound for a whole refresh exchange, retries included.
const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(120);

pub struct AuthorizationGate {
    store: Arc<dyn AuthorizationStore>,
    clients: HashMap<String, Arc<OAuth2Client>>,
    clock: Arc<dyn Clock>,
    event_bus: EventBus,
    refresh_timeout: Duration,
}

impl AuthorizationGate {
    pub fn new(
        store: Arc<dyn AuthorizationStore>,
        clock: Arc<dyn Clock>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            store,
            clients: HashMap::new(),
            clock,
            event_bus,
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
        }
    }

    /// Build a gate with one [`OAuth2Client`] per configured OAuth2 service.
    pub fn from_config(
        store: Arc<dyn AuthorizationStore>,
        config: &PipesConfig,
        event_bus: EventBus,
    ) -> Self {
        let http_client: Arc<dyn HttpClient> = config.http_client.clone();
        let mut gate = Self::new(store, config.clock.clone(), event_bus);
        for (service_id, settings) in &config.oauth2_clients {
            gate = gate.with_client(OAuth2Client::new(
                service_id.clone(),
                settings.clone(),
                http_client.clone(),
                config.clock.clone(),
                config.request_timeout,
            ));
        }
        gate
    }

    pub fn with_client(mut self, client: OAuth2Client) -> Self {
        self.clients
            .insert(client.service_id().to_string(), Arc::new(client));
        self
    }

    pub fn with_refresh_timeout(mut self, refresh_timeout: Duration) -> Self {
        self.refresh_timeout = refresh_timeout;
        self
    }

    pub fn store(&self) -> &Arc<dyn AuthorizationStore> {
        &self.store
    }

    /// Return a usable authorization, refreshing and persisting it if needed.
    #[instrument(skip(self), fields(workspace_id = workspace_id, service_id = %service_id))]
    pub async fn authorize(
        &self,
        workspace_id: WorkspaceId,
        service_id: &str,
        auth_type: AuthorizationType,
    ) -> Result<Authorization> {
        let mut authorization = self
            .store
            .load(workspace_id, service_id)
            .await?
            .ok_or_else(|| AuthError::NotFound {
                workspace_id,
                service_id: service_id.to_string(),
            })?;

        if auth_type != AuthorizationType::OAuth2 {
            return Ok(authorization);
        }

        let token = authorization.oauth2_token()?;
        if !token.is_expired_at(self.clock.now()) {
            debug!("Token is valid, no refresh needed");
            return Ok(authorization);
        }

        info!("Token expired, refreshing");

        let client = self
            .clients
            .get(service_id)
            .ok_or_else(|| AuthError::MissingClientConfig(service_id.to_string()))?;

        let refreshed = match timeout(self.refresh_timeout, client.refresh(&token)).await {
            Ok(Ok(refreshed)) => refreshed,
            Ok(Err(e)) => {
                error!(error = %e, "Token refresh failed");
                self.emit_refresh_failed(workspace_id, service_id, e.to_string());
                return Err(e);
            }
            Err(_) => {
                error!("Token refresh timed out");
                self.emit_refresh_failed(workspace_id, service_id, "timeout".to_string());
                return Err(AuthError::OperationTimeout {
                    operation: "token refresh".to_string(),
                });
            }
        };

        authorization.set_oauth2_token(&refreshed)?;
        self.store.save(&authorization).await?;

        let _ = self.event_bus.emit(CoreEvent::Auth(AuthEvent::TokenRefreshed {
            workspace_id,
            service_id: service_id.to_string(),
            expires_at: refreshed.expires_at.map(|t| t.timestamp()),
        }));

        Ok(authorization)
    }

    fn emit_refresh_failed(&self, workspace_id: WorkspaceId, service_id: &str, message: String) {
        let _ = self.event_bus.emit(CoreEvent::Auth(AuthEvent::RefreshFailed {
            workspace_id,
            service_id: service_id.to_string(),
            message,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OAuth2Token;
    use async_trait::async_trait;
    use bridge_traits::error::Result as BridgeResult;
    use bridge_traits::http::{HttpRequest, HttpResponse};
    use bridge_traits::time::FixedClock;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use core_runtime::config::OAuth2ClientSettings;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct MemoryStore {
        entries: Mutex<HashMap<(i64, String), Authorization>>,
        saves: AtomicUsize,
    }

    #[async_trait]
    impl AuthorizationStore for MemoryStore {
        async fn load(&self, workspace_id: i64, service_id: &str) -> Result<Option<Authorization>> {
            Ok(self
                .entries
                .lock()
                .await
                .get(&(workspace_id, service_id.to_string()))
                .cloned())
        }

        async fn save(&self, authorization: &Authorization) -> Result<()> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            self.entries.lock().await.insert(
                (authorization.workspace_id, authorization.service_id.clone()),
                authorization.clone(),
            );
            Ok(())
        }

        async fn delete(&self, workspace_id: i64, service_id: &str) -> Result<()> {
            self.entries
                .lock()
                .await
                .remove(&(workspace_id, service_id.to_string()));
            Ok(())
        }

        async fn load_workspace_authorizations(
            &self,
            _workspace_id: i64,
        ) -> Result<HashMap<String, bool>> {
            Ok(HashMap::new())
        }
    }

    struct TokenEndpoint {
        calls: AtomicUsize,
        status: u16,
    }

    #[async_trait]
    impl HttpClient for TokenEndpoint {
        async fn execute(&self, _request: HttpRequest) -> BridgeResult<HttpResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.status == 200 {
                Ok(HttpResponse::new(
                    200,
                    r#"{"access_token":"fresh","expires_in":7200}"#,
                ))
            } else {
                Ok(HttpResponse::new(self.status, r#"{"error":"invalid_grant"}"#))
            }
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn token(expires_at: DateTime<Utc>) -> serde_json::Value {
        serde_json::to_value(OAuth2Token {
            access_token: "stale".to_string(),
            token_type: Some("Bearer".to_string()),
            refresh_token: Some("refresh".to_string()),
            expires_at: Some(expires_at),
        })
        .unwrap()
    }

    async fn gate_with(
        status: u16,
        data: serde_json::Value,
    ) -> (AuthorizationGate, Arc<MemoryStore>, Arc<TokenEndpoint>) {
        let store = Arc::new(MemoryStore::default());
        store
            .save(&Authorization::new(1, "asana", "ws-token", data))
            .await
            .unwrap();
        store.saves.store(0, Ordering::SeqCst);

        let endpoint = Arc::new(TokenEndpoint {
            calls: AtomicUsize::new(0),
            status,
        });
        let clock: Arc<dyn Clock> = Arc::new(FixedClock(now()));
        let client = OAuth2Client::new(
            "asana",
            OAuth2ClientSettings {
                client_id: "id".to_string(),
                client_secret: "secret".to_string(),
                token_url: "https://asana.example/token".to_string(),
            },
            endpoint.clone(),
            clock.clone(),
            Duration::from_secs(5),
        );
        let gate =
            AuthorizationGate::new(store.clone(), clock, EventBus::new(8)).with_client(client);
        (gate, store, endpoint)
    }

    #[tokio::test]
    async fn test_valid_token_is_returned_without_refresh() {
        let (gate, store, endpoint) = gate_with(200, token(now() + ChronoDuration::hours(1))).await;

        let auth = gate.authorize(1, "asana", AuthorizationType::OAuth2).await.unwrap();

        assert_eq!(auth.data["access_token"], "stale");
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.saves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_expired_token_refreshes_once_and_persists() {
        let (gate, store, endpoint) = gate_with(200, token(now() - ChronoDuration::hours(1))).await;
        let mut events = gate.event_bus.subscribe();

        let auth = gate.authorize(1, "asana", AuthorizationType::OAuth2).await.unwrap();

        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.saves.load(Ordering::SeqCst), 1);
        assert_eq!(auth.data["access_token"], "fresh");

        let persisted = store.load(1, "asana").await.unwrap().unwrap();
        assert_eq!(persisted.data, auth.data);
        assert_eq!(persisted.oauth2_token().unwrap().refresh_token.as_deref(), Some("refresh"));

        assert!(matches!(
            events.recv().await.unwrap(),
            CoreEvent::Auth(AuthEvent::TokenRefreshed { workspace_id: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_refresh_failure_is_distinguished() {
        let (gate, store, _) = gate_with(401, token(now() - ChronoDuration::hours(1))).await;

        let err = gate
            .authorize(1, "asana", AuthorizationType::OAuth2)
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::TokenRefreshFailed(_)));
        assert!(!err.is_load_failure());
        assert_eq!(store.saves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_slow_refresh_times_out() {
        let (gate, store, endpoint) = gate_with(503, token(now() - ChronoDuration::hours(1))).await;
        let gate = gate.with_refresh_timeout(Duration::from_millis(50));

        let err = gate
            .authorize(1, "asana", AuthorizationType::OAuth2)
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::OperationTimeout { .. }));
        assert!(endpoint.calls.load(Ordering::SeqCst) >= 1);
        assert_eq!(store.saves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_oauth1_skips_refresh() {
        let (gate, _, endpoint) =
            gate_with(200, json!({"oauth_token": "t", "oauth_token_secret": "s"})).await;

        let auth = gate.authorize(1, "asana", AuthorizationType::OAuth1).await.unwrap();

        assert_eq!(auth.data["oauth_token"], "t");
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_authorization_is_load_failure() {
        let (gate, _, _) = gate_with(200, json!({})).await;

        let err = gate
            .authorize(2, "asana", AuthorizationType::OAuth2)
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::NotFound { workspace_id: 2, .. }));
        assert!(err.is_load_failure());
    }

    #[tokio::test]
    async fn test_missing_client_config() {
        let store = Arc::new(MemoryStore::default());
        store
            .save(&Authorization::new(1, "github", "t", token(now() - ChronoDuration::hours(1))))
            .await
            .unwrap();
        let gate = AuthorizationGate::new(store, Arc::new(FixedClock(now())), EventBus::new(8));

        let err = gate
            .authorize(1, "github", AuthorizationType::OAuth2)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::MissingClientConfig(s) if s == "github"));
    }
}

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{AuthError, Result};

/// Workspace identifier in the central time-tracking service.
pub type WorkspaceId = i64;

/// Tokens whose expiry falls within this window are treated as expired.
pub const TOKEN_EXPIRY_BUFFER: Duration = Duration::seconds(60);

/// How a provider authorizes API calls.
///
/// # Examples
///
/// ```
/// use core_auth::AuthorizationType;
///
/// let auth_type: AuthorizationType = "oauth2".parse().unwrap();
/// assert_eq!(auth_type, AuthorizationType::OAuth2);
/// assert_eq!(auth_type.as_str(), "oauth2");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationType {
    OAuth1,
    OAuth2,
}

impl AuthorizationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthorizationType::OAuth1 => "oauth1",
            AuthorizationType::OAuth2 => "oauth2",
        }
    }
}

impl FromStr for AuthorizationType {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "oauth1" => Ok(AuthorizationType::OAuth1),
            "oauth2" => Ok(AuthorizationType::OAuth2),
            other => Err(AuthError::InvalidToken(format!(
                "unknown authorization type '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for AuthorizationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored credentials for one (workspace, service) pair.
///
/// `data` is opaque to the engine: OAuth1 blobs are passed through untouched,
/// OAuth2 blobs decode to an [`OAuth2Token`].
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct Authorization {
    pub workspace_id: WorkspaceId,
    pub service_id: String,
    /// API token of the workspace in the central service.
    pub workspace_token: String,
    pub data: serde_json::Value,
}

impl Authorization {
    pub fn new(
        workspace_id: WorkspaceId,
        service_id: impl Into<String>,
        workspace_token: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            workspace_id,
            service_id: service_id.into(),
            workspace_token: workspace_token.into(),
            data,
        }
    }

    /// Decode the credential blob as an OAuth2 token.
    pub fn oauth2_token(&self) -> Result<OAuth2Token> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| AuthError::InvalidToken(format!("cannot decode oauth2 token: {}", e)))
    }

    /// Replace the credential blob with `token`.
    pub fn set_oauth2_token(&mut self, token: &OAuth2Token) -> Result<()> {
        self.data = serde_json::to_value(token)
            .map_err(|e| AuthError::InvalidToken(format!("cannot encode oauth2 token: {}", e)))?;
        Ok(())
    }
}

impl fmt::Debug for Authorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authorization")
            .field("workspace_id", &self.workspace_id)
            .field("service_id", &self.service_id)
            .field("workspace_token", &"[REDACTED]")
            .field("data", &"[REDACTED]")
            .finish()
    }
}

/// OAuth2 token as persisted in the authorization blob.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OAuth2Token {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Absent (or the zero timestamp) means the token never expires.
    #[serde(default, rename = "expiry", skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl OAuth2Token {
    /// Check whether the token is expired at `now`, including [`TOKEN_EXPIRY_BUFFER`].
    ///
    /// ```
    /// use chrono::{Duration, Utc};
    /// use core_auth::OAuth2Token;
    ///
    /// let token = OAuth2Token {
    ///     access_token: "token".to_string(),
    ///     token_type: None,
    ///     refresh_token: Some("refresh".to_string()),
    ///     expires_at: Some(Utc::now() + Duration::minutes(10)),
    /// };
    /// assert!(!token.is_expired_at(Utc::now()));
    /// ```
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            // Zero-valued expiry timestamps are written by some token libraries.
            Some(expiry) if expiry.timestamp() > 0 => now >= expiry - TOKEN_EXPIRY_BUFFER,
            _ => false,
        }
    }
}

impl fmt::Debug for OAuth2Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuth2Token")
            .field("access_token", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

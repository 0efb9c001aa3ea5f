//! # Authorization Module
//!
//! Stored provider credentials and the gate that keeps them usable.
//!
//! ## Overview
//!
//! Every (workspace, service) pair owns one [`Authorization`]: an opaque
//! credential blob plus the workspace's central-service token. Interactive
//! OAuth flows live outside the engine; this crate only loads, refreshes and
//! persists what those flows produced.
//!
//! ## Features
//!
//! - [`AuthorizationStore`] trait with a SQLite implementation
//! - OAuth2 refresh-token grant with retry on server errors ([`OAuth2Client`])
//! - [`AuthorizationGate`] that refreshes expired OAuth2 tokens before a run
//! - Token refresh event emission on the shared event bus

pub mod error;
pub mod gate;
pub mod oauth;
pub mod store;
pub mod types;

pub use error::{AuthError, Result};
pub use gate::AuthorizationGate;
pub use oauth::OAuth2Client;
pub use store::{AuthorizationStore, SqliteAuthorizationStore};
pub use types::{Authorization, AuthorizationType, OAuth2Token, WorkspaceId, TOKEN_EXPIRY_BUFFER};

//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for server and desktop hosts.
//!
//! ## Overview
//!
//! - `HttpClient` using `reqwest` (rustls, pooled connections, bounded timeouts)
//!
//! The clock and error-sink defaults live next to their traits
//! (`bridge_traits::SystemClock`) and in `core-runtime` (`TracingErrorReporter`).
//!
//! ## Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use bridge_desktop::ReqwestHttpClient;
//!
//! let http_client = Arc::new(ReqwestHttpClient::with_timeout(config.request_timeout)?);
//! ```

mod http;

pub use http::{ReqwestHttpClient, DEFAULT_REQUEST_TIMEOUT};

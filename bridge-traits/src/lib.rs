//! # Host Bridge Traits
//!
//! Capability contracts the synchronization engine consumes from its host.
//!
//! ## Overview
//!
//! The engine never talks to the network, the wall clock or a telemetry backend
//! directly. Each of those concerns is a trait here, with concrete adapters living
//! in `bridge-desktop` (or in test doubles).
//!
//! ## Traits
//!
//! - [`HttpClient`](http::HttpClient) - Async HTTP for the central service API and OAuth token endpoints
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//! - [`ErrorReporter`](report::ErrorReporter) - External error/telemetry sink
//!
//! ## Error Handling
//!
//! All bridge traits use [`BridgeError`](error::BridgeError). Implementations
//! should convert platform errors to it and keep messages actionable.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` so they can be shared across workers.

pub mod error;
pub mod http;
pub mod report;
pub mod time;

pub use error::BridgeError;

pub use http::{Backoff, HttpClient, HttpMethod, HttpRequest, HttpResponse};
pub use report::{ErrorReport, ErrorReporter, NoopReporter};
pub use time::{Clock, FixedClock, ManualClock, SystemClock};

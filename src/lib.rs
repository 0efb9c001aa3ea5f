//! Workspace placeholder crate.
//!
//! This crate exists to expose shared feature flags that map to the individual
//! workspace crates. Host applications can depend on `pipes-workspace` and
//! enable the documented features without wiring each crate individually.
//!
//! ## Features
//!
//! - `desktop-shims` (default): enables `core-service` with the reqwest-backed
//!   HTTP client from `bridge-desktop`.

#[cfg(feature = "desktop-shims")]
pub use core_service::*;

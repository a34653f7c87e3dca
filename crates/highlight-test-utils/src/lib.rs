#![deny(unsafe_code)]

//! Shared test utilities for the highlight workspace.
//!
//! Provides config builders, subscription fixtures, and tracing helpers so
//! that integration tests stay concise and consistent.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! highlight-test-utils = { workspace = true }
//! ```

pub mod config;
pub mod fixtures;
pub mod tracing_setup;

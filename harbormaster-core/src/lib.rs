//! Harbormaster Core Library
//!
//! Shared state model and runtime configuration for the deployment proxy:
//! the persisted project/host document (the State Store) and the handful of
//! environment-derived settings the other crates need to find it.

pub mod error;
pub mod runtime_config;
pub mod state;

pub use error::{Error, Result};
pub use runtime_config::RuntimeConfig;

/// Harbormaster version information.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

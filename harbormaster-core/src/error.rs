//! Error types for harbormaster-core

use thiserror::Error;

/// Result type for harbormaster-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type shared by the state store and runtime configuration.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad or missing runtime configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// State document I/O failure (read/write/rename of state.json).
    #[error("state store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// State document failed to parse as JSON.
    #[error("state store is corrupt: {0}")]
    Corrupt(String),

    /// A lookup against the state store found nothing.
    #[error("not found: {0}")]
    NotFound(String),

    /// A request violated a state invariant (e.g. empty hostname).
    #[error("invalid request: {0}")]
    Invalid(String),

    /// Internal error that should not normally occur.
    #[error("internal error: {0}")]
    Internal(String),
}

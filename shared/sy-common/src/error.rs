//! Contract Errors

use thiserror::Error;

/// Errors produced while encoding or decoding queue messages.
#[derive(Debug, Error)]
pub enum Error {
    /// The message could not be serialized or deserialized.
    #[error("Invalid task encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    /// An event identity was empty.
    #[error("Event identity must not be empty")]
    EmptyIdentity,
}

/// Result alias for contract operations.
pub type Result<T> = std::result::Result<T, Error>;

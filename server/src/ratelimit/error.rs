//! Rate limiting error types.

use thiserror::Error;

use crate::store::StoreError;

/// Errors that can occur during rate limit checks.
#[derive(Debug, Error)]
pub enum RateLimitError {
    /// The shared store is unavailable and the limiter is configured to fail closed.
    #[error("Rate limit store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),
}

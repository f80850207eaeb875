//! Rate limiting module for protecting against abuse.
//!
//! Fixed-window request counting per source (bot/workspace), backed by the
//! shared store so every server instance sees the same counters.

pub mod config;
pub mod error;
pub mod limiter;
pub mod types;

pub use config::*;
pub use error::*;
pub use limiter::*;
pub use types::*;

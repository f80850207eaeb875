//! Shared Store
//!
//! The rate-limit counters and dedup records live in a store shared by every
//! server instance. Components receive an explicit [`SharedStore`] handle; all
//! mutations are single atomic operations on the store side.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryStore;
pub use redis::{create_redis_client, RedisStore};

/// Errors from the shared store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store rejected the command or the connection failed.
    #[error("Shared store unavailable: {0}")]
    Unavailable(String),
    /// The store did not answer within the configured deadline.
    #[error("Shared store timed out after {0:?}")]
    Timeout(Duration),
}

/// Counter state after a fixed-window increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Requests counted in the current window, including this one.
    pub count: u64,
    /// Time until the current window rolls over.
    pub resets_in: Duration,
}

/// Atomic primitives the ingestion pipeline needs from the shared store.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Increment the window counter at `key`.
    ///
    /// When no window is open the counter starts at 1 and expires after
    /// `window`, in the same atomic step.
    async fn increment_window(&self, key: &str, window: Duration)
        -> Result<WindowCount, StoreError>;

    /// Insert `value` at `key` with `ttl` unless a live entry already exists.
    ///
    /// Returns `true` when this call created the entry.
    async fn insert_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, StoreError>;

    /// Delete `key` if present.
    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Round-trip to the store (readiness check).
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Run a store future with a deadline so callers fail fast.
pub(crate) async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T, StoreError>
where
    F: std::future::Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| StoreError::Timeout(deadline))?
}

//! Core rate limiter service over the shared store.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::ratelimit::{Admission, RateLimitConfig, RateLimitError};
use crate::store::SharedStore;

/// Fixed-window rate limiter keyed by source id.
///
/// Each `admit` is one atomic increment-and-read in the shared store, so
/// concurrent requests for the same source across instances never race.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn SharedStore>,
    config: Arc<RateLimitConfig>,
}

impl RateLimiter {
    /// Creates a new rate limiter instance.
    pub fn new(store: Arc<dyn SharedStore>, config: RateLimitConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
        }
    }

    /// Counts a request from `source_id` against its window and decides
    /// whether it may proceed.
    ///
    /// # Errors
    /// Returns `RateLimitError::StoreUnavailable` if the store is unreachable
    /// and `fail_open` is disabled.
    #[tracing::instrument(skip(self))]
    pub async fn admit(&self, source_id: &str) -> Result<Admission, RateLimitError> {
        if !self.config.enabled {
            return Ok(Admission::bypassed());
        }

        if self.is_allowed_by_config(source_id) {
            debug!(source_id = %source_id, "Source in allowlist, bypassing rate limit");
            return Ok(Admission::bypassed());
        }

        let limit = self.config.limit_for(source_id);
        let key = self.build_key(source_id);

        let window = match self.store.increment_window(&key, limit.window()).await {
            Ok(window) => window,
            Err(e) if self.config.fail_open => {
                warn!(source_id = %source_id, error = %e, "Rate limit store unavailable, failing open");
                return Ok(Admission::bypassed());
            }
            Err(e) => {
                warn!(source_id = %source_id, error = %e, "Rate limit store unavailable");
                return Err(RateLimitError::StoreUnavailable(e));
            }
        };

        let count = u32::try_from(window.count).unwrap_or(u32::MAX);
        if count <= limit.requests {
            Ok(Admission::Allowed {
                limit: limit.requests,
                remaining: limit.requests - count,
            })
        } else {
            // Round up so clients never retry before the window has actually rolled.
            let retry_after = window.resets_in.as_millis().div_ceil(1000).max(1) as u64;
            Ok(Admission::Throttled {
                limit: limit.requests,
                retry_after,
            })
        }
    }

    /// Checks if the source is in the allowlist configuration.
    pub fn is_allowed_by_config(&self, source_id: &str) -> bool {
        self.config.allowlist.contains(source_id)
    }

    /// Returns the configuration for this rate limiter.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Builds a store key with the configured prefix.
    fn build_key(&self, source_id: &str) -> String {
        format!("{}:{}", self.config.key_prefix, source_id)
    }
}

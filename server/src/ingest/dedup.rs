//! Event deduplication.
//!
//! Each event identity is claimed once with a conditional insert. The record
//! expires after its TTL; until then every redelivery is reported as seen.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sy_common::EventIdentity;

use crate::store::{SharedStore, StoreError};

/// Default retention for dedup records (6 hours).
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(6 * 60 * 60);

/// Result of claiming an event identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// First sighting within the TTL; the caller owns the event.
    Claimed,
    /// Another delivery already claimed this identity.
    AlreadySeen,
}

#[derive(Clone)]
pub struct Deduplicator {
    store: Arc<dyn SharedStore>,
    key_prefix: String,
    ttl: Duration,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn SharedStore>, key_prefix: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
            ttl,
        }
    }

    /// Atomically records `identity` unless a live record exists.
    ///
    /// The stored value is the first-seen time (RFC 3339).
    #[tracing::instrument(skip(self), fields(event_identity = %identity))]
    pub async fn claim(&self, identity: &EventIdentity) -> Result<ClaimOutcome, StoreError> {
        let first_seen = Utc::now().to_rfc3339();
        let created = self
            .store
            .insert_if_absent(&self.key(identity), &first_seen, self.ttl)
            .await?;

        Ok(if created {
            ClaimOutcome::Claimed
        } else {
            ClaimOutcome::AlreadySeen
        })
    }

    /// Deletes the claim so a redelivery of the same event is admitted again.
    pub async fn release(&self, identity: &EventIdentity) -> Result<(), StoreError> {
        self.store.remove(&self.key(identity)).await
    }

    pub fn key(&self, identity: &EventIdentity) -> String {
        format!("{}:dedup:{}", self.key_prefix, identity)
    }
}

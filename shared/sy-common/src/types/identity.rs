//! Event Identity
//!
//! Deterministic key used to admit an upstream event at most once.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Prefix for identities derived from a content hash rather than an event id.
const HASH_PREFIX: &str = "sha256:";

/// Identity of an inbound event.
///
/// Either the platform-assigned event id or, when the platform did not send
/// one, a SHA-256 digest of the raw request body.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventIdentity(String);

impl EventIdentity {
    /// Wrap an existing identity string.
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.is_empty() {
            return Err(Error::EmptyIdentity);
        }
        Ok(Self(value))
    }

    /// Derive the identity of a raw event.
    ///
    /// Uses `event_id` when it is present and non-blank, otherwise hashes `body`.
    pub fn derive(event_id: Option<&str>, body: &[u8]) -> Self {
        match event_id.map(str::trim) {
            Some(id) if !id.is_empty() => Self(id.to_string()),
            _ => Self::from_content(body),
        }
    }

    /// Identity from the SHA-256 digest of `body`.
    pub fn from_content(body: &[u8]) -> Self {
        let digest = Sha256::digest(body);
        Self(format!("{HASH_PREFIX}{}", hex::encode(digest)))
    }

    /// Whether this identity was derived from a content hash.
    pub fn is_content_hash(&self) -> bool {
        self.0.starts_with(HASH_PREFIX)
    }

    /// The identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EventIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

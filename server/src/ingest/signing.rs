//! HMAC-SHA256 Request Signing
//!
//! Verifies that inbound webhooks were signed by the platform. The signed
//! string is `v0:{timestamp}:{body}` and the header carries `v0={hex}`.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Version prefix of the signing scheme.
pub const SIGNATURE_VERSION: &str = "v0";

/// Default tolerated clock skew between platform and server (5 minutes).
pub const DEFAULT_MAX_SKEW_SECS: u64 = 300;

/// Reasons a request signature is rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing timestamp or signature header")]
    MissingHeaders,
    #[error("timestamp header is not a unix timestamp")]
    InvalidTimestamp,
    #[error("timestamp outside the allowed window ({skew_secs}s skew)")]
    StaleTimestamp { skew_secs: u64 },
    #[error("signature mismatch")]
    Mismatch,
}

/// Sign a request body and return the header value (`v0=<hex>`).
pub fn sign_request(secret: &str, timestamp: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(SIGNATURE_VERSION.as_bytes());
    mac.update(b":");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(body);
    format!("{SIGNATURE_VERSION}={}", hex::encode(mac.finalize().into_bytes()))
}

/// Compare two byte strings without short-circuiting on the first difference.
fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    expected.len() == provided.len()
        && expected
            .iter()
            .zip(provided)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

/// Validates request signatures against the shared signing secret.
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: String,
    max_skew_secs: u64,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("secret", &"<redacted>")
            .field("max_skew_secs", &self.max_skew_secs)
            .finish()
    }
}

impl SignatureVerifier {
    pub fn new(secret: impl Into<String>, max_skew_secs: u64) -> Self {
        Self {
            secret: secret.into(),
            max_skew_secs,
        }
    }

    /// Verify the timestamp and signature headers for `body` as of `now`.
    ///
    /// Pure: no side effects, no logging of secrets or payloads.
    pub fn verify(
        &self,
        timestamp: Option<&str>,
        signature: Option<&str>,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), SignatureError> {
        let (Some(timestamp), Some(signature)) = (timestamp, signature) else {
            return Err(SignatureError::MissingHeaders);
        };

        let sent_at: i64 = timestamp
            .trim()
            .parse()
            .map_err(|_| SignatureError::InvalidTimestamp)?;
        let skew_secs = now.timestamp().abs_diff(sent_at);
        if skew_secs > self.max_skew_secs {
            return Err(SignatureError::StaleTimestamp { skew_secs });
        }

        let expected = sign_request(&self.secret, timestamp, body);
        if constant_time_eq(expected.as_bytes(), signature.trim().as_bytes()) {
            Ok(())
        } else {
            Err(SignatureError::Mismatch)
        }
    }
}

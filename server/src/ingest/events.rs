//! Inbound Event Types
//!
//! The raw request as captured by the webhook handler, and the subset of the
//! Slack Events API envelope the pipeline reads.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Envelope type for the one-time endpoint ownership handshake.
pub const URL_VERIFICATION: &str = "url_verification";

/// Envelope type wrapping a workspace event.
pub const EVENT_CALLBACK: &str = "event_callback";

/// A webhook request exactly as received. Never mutated after capture.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub body: Bytes,
    pub timestamp: Option<String>,
    pub signature: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl InboundEvent {
    pub fn new(body: Bytes, timestamp: Option<String>, signature: Option<String>) -> Self {
        Self {
            body,
            timestamp,
            signature,
            received_at: Utc::now(),
        }
    }
}

/// Outer Events API envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub event_id: Option<String>,
    /// The app the event is addressed to; used as the source id.
    #[serde(default)]
    pub api_app_id: Option<String>,
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(default)]
    pub challenge: Option<String>,
    #[serde(default)]
    pub event: Option<MessageEvent>,
}

impl EventEnvelope {
    /// Identity of the configured bot this event pertains to.
    pub fn source_id(&self) -> Option<&str> {
        self.api_app_id
            .as_deref()
            .or(self.team_id.as_deref())
            .filter(|s| !s.is_empty())
    }
}

/// Inner event of an `event_callback` envelope.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub bot_id: Option<String>,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub ts: Option<String>,
    #[serde(default)]
    pub thread_ts: Option<String>,
    #[serde(default)]
    pub files: Vec<FileInfo>,
}

/// File metadata attached to a message.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mimetype: String,
    #[serde(default)]
    pub url_private: String,
    #[serde(default)]
    pub size: u64,
}

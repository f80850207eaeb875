//! Dispatch Task Contract
//!
//! The unit of work handed from ingestion to the worker pool. Tasks are
//! serialized as JSON onto the queue; the bot's credentials are never part of
//! the message and are resolved by the worker from its own configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::identity::EventIdentity;
use crate::error::Result;

/// Kind of file attached to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Pdf,
}

impl AttachmentKind {
    /// Upper-case label used when describing the file to the automation.
    pub const fn label(self) -> &'static str {
        match self {
            Self::Image => "IMAGE",
            Self::Pdf => "PDF",
        }
    }
}

/// A file shared alongside the triggering message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub name: String,
    pub kind: AttachmentKind,
    pub mimetype: String,
    /// Private download URL (requires the bot token).
    pub url: String,
    pub size: u64,
}

/// The routed message content carried by a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPayload {
    /// Channel the message was posted in.
    pub channel: String,
    /// Author of the message.
    pub user: String,
    /// Message text with bot mentions stripped.
    pub text: String,
    /// Timestamp of the triggering message.
    pub ts: String,
    /// Thread parent, if the message was posted in a thread.
    pub thread_ts: Option<String>,
    #[serde(default)]
    pub files: Vec<Attachment>,
    /// Conversation session, stable per channel and thread.
    pub session_id: Uuid,
}

impl TaskPayload {
    /// Timestamp replies should be threaded under.
    pub fn reply_ts(&self) -> &str {
        self.thread_ts.as_deref().unwrap_or(&self.ts)
    }
}

/// A unit of work on the dispatch queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchTask {
    pub task_id: Uuid,
    pub event_identity: EventIdentity,
    /// Key into the bot configuration map.
    pub source_id: String,
    pub payload: TaskPayload,
    pub enqueue_time: DateTime<Utc>,
    /// Number of execution attempts already made.
    pub attempt_count: u32,
}

impl DispatchTask {
    /// Create a fresh task for a newly admitted event.
    pub fn new(
        event_identity: EventIdentity,
        source_id: impl Into<String>,
        payload: TaskPayload,
    ) -> Self {
        Self {
            task_id: Uuid::now_v7(),
            event_identity,
            source_id: source_id.into(),
            payload,
            enqueue_time: Utc::now(),
            attempt_count: 0,
        }
    }

    /// Copy of this task with the attempt counter advanced.
    #[must_use]
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt_count: self.attempt_count + 1,
            ..self.clone()
        }
    }

    /// Encode for the queue.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a queue message.
    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Record left behind when a task exhausts its attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub task_id: Uuid,
    pub event_identity: EventIdentity,
    pub source_id: String,
    pub channel: String,
    pub attempts: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl FailureRecord {
    /// Build a failure record for `task` after `attempts` attempts.
    pub fn for_task(task: &DispatchTask, attempts: u32, error: impl Into<String>) -> Self {
        Self {
            task_id: task.task_id,
            event_identity: task.event_identity.clone(),
            source_id: task.source_id.clone(),
            channel: task.payload.channel.clone(),
            attempts,
            error: error.into(),
            failed_at: Utc::now(),
        }
    }
}

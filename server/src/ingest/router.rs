//! Event Router
//!
//! Decides whether a verified, admitted event should reach the automation.
//! Classification is pure: the same envelope and bot always give the same
//! answer.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use sy_common::{Attachment, AttachmentKind, TaskPayload};
use uuid::Uuid;

use crate::bots::BotConfig;
use crate::ingest::events::{EventEnvelope, FileInfo, MessageEvent, EVENT_CALLBACK};

/// Regex matching `<@USERID>` mentions.
static MENTION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<@[A-Z0-9]+>").expect("valid regex"));

/// Message subtypes that never trigger the automation.
const FILTERED_SUBTYPES: &[&str] = &[
    "bot_message",
    "message_changed",
    "message_deleted",
    "channel_join",
    "channel_leave",
    "channel_topic",
    "channel_purpose",
    "channel_name",
    "channel_archive",
    "channel_unarchive",
    "group_join",
    "group_leave",
    "group_topic",
    "group_purpose",
    "group_name",
    "group_archive",
    "group_unarchive",
    "file_comment",
    "file_mention",
    "pinned_item",
    "unpinned_item",
];

/// The only subtype that is dispatched (file uploads with a message).
const FILE_SHARE_SUBTYPE: &str = "file_share";

/// Event types the router accepts.
///
/// A mention arrives twice, as `message` and as `app_mention`, with distinct
/// event ids and the same `ts`. Only the `message` copy is dispatched.
const DISPATCHED_EVENT_TYPES: &[&str] = &["message"];

/// Files considered per message.
pub const MAX_ATTACHMENTS: usize = 5;

/// Largest attachment forwarded (10 MiB).
pub const MAX_ATTACHMENT_BYTES: u64 = 10 * 1024 * 1024;

/// Why an event was not dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    NotEventCallback(String),
    MissingEvent,
    UnsupportedEventType(String),
    SelfAuthored,
    BotMessage,
    FilteredSubtype(String),
    UnknownSubtype(String),
    ChannelNotAllowed(String),
    MissingAuthor,
    EmptyMessage,
    UnknownSource,
}

impl IgnoreReason {
    /// Stable label for logs and metrics.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NotEventCallback(_) => "not_event_callback",
            Self::MissingEvent => "missing_event",
            Self::UnsupportedEventType(_) => "unsupported_event_type",
            Self::SelfAuthored => "self_authored",
            Self::BotMessage => "bot_message",
            Self::FilteredSubtype(_) => "filtered_subtype",
            Self::UnknownSubtype(_) => "unknown_subtype",
            Self::ChannelNotAllowed(_) => "channel_not_allowed",
            Self::MissingAuthor => "missing_author",
            Self::EmptyMessage => "empty_message",
            Self::UnknownSource => "unknown_source",
        }
    }
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotEventCallback(kind)
            | Self::UnsupportedEventType(kind)
            | Self::FilteredSubtype(kind)
            | Self::UnknownSubtype(kind)
            | Self::ChannelNotAllowed(kind) => write!(f, "{}:{kind}", self.as_str()),
            _ => f.write_str(self.as_str()),
        }
    }
}

/// Routing decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Dispatchable(TaskPayload),
    Ignored(IgnoreReason),
}

/// Classify an envelope against the bot it is addressed to.
pub fn classify(envelope: &EventEnvelope, bot: &BotConfig) -> Route {
    match route_message(envelope, bot) {
        Ok(payload) => Route::Dispatchable(payload),
        Err(reason) => Route::Ignored(reason),
    }
}

fn route_message(envelope: &EventEnvelope, bot: &BotConfig) -> Result<TaskPayload, IgnoreReason> {
    if envelope.kind != EVENT_CALLBACK {
        return Err(IgnoreReason::NotEventCallback(envelope.kind.clone()));
    }
    let event = envelope.event.as_ref().ok_or(IgnoreReason::MissingEvent)?;

    if !DISPATCHED_EVENT_TYPES.contains(&event.kind.as_str()) {
        return Err(IgnoreReason::UnsupportedEventType(event.kind.clone()));
    }

    check_author(event, bot)?;
    check_subtype(event)?;

    let channel = non_empty(event.channel.as_deref())
        .ok_or_else(|| IgnoreReason::ChannelNotAllowed(String::new()))?;
    if !bot.allows_channel(channel) {
        return Err(IgnoreReason::ChannelNotAllowed(channel.to_string()));
    }

    let user = non_empty(event.user.as_deref()).ok_or(IgnoreReason::MissingAuthor)?;

    let text = strip_mentions(event.text.as_deref().unwrap_or_default());
    let files = extract_attachments(&event.files);
    if text.is_empty() && files.is_empty() {
        return Err(IgnoreReason::EmptyMessage);
    }

    let thread_ts = non_empty(event.thread_ts.as_deref()).map(str::to_string);
    let team_id = envelope.team_id.as_deref().unwrap_or_default();

    Ok(TaskPayload {
        channel: channel.to_string(),
        user: user.to_string(),
        text,
        ts: event.ts.clone().unwrap_or_default(),
        session_id: session_id(team_id, channel, thread_ts.as_deref()),
        thread_ts,
        files,
    })
}

fn check_author(event: &MessageEvent, bot: &BotConfig) -> Result<(), IgnoreReason> {
    if event.user.as_deref() == Some(bot.bot_user_id.as_str()) {
        return Err(IgnoreReason::SelfAuthored);
    }
    if non_empty(event.bot_id.as_deref()).is_some() {
        return Err(IgnoreReason::BotMessage);
    }
    Ok(())
}

fn check_subtype(event: &MessageEvent) -> Result<(), IgnoreReason> {
    match event.subtype.as_deref() {
        None | Some(FILE_SHARE_SUBTYPE) => Ok(()),
        Some(subtype) if FILTERED_SUBTYPES.contains(&subtype) => {
            Err(IgnoreReason::FilteredSubtype(subtype.to_string()))
        }
        Some(subtype) => Err(IgnoreReason::UnknownSubtype(subtype.to_string())),
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// Remove `<@USER>` mentions and surrounding whitespace.
pub fn strip_mentions(text: &str) -> String {
    MENTION_REGEX.replace_all(text, "").trim().to_string()
}

/// Supported attachments among the first [`MAX_ATTACHMENTS`] files.
pub fn extract_attachments(files: &[FileInfo]) -> Vec<Attachment> {
    files
        .iter()
        .take(MAX_ATTACHMENTS)
        .filter_map(|file| {
            let kind = attachment_kind(&file.name)?;
            if file.size > MAX_ATTACHMENT_BYTES {
                tracing::warn!(file_id = %file.id, size = file.size, "Attachment too large, skipping");
                return None;
            }
            Some(Attachment {
                id: file.id.clone(),
                name: file.name.clone(),
                kind,
                mimetype: file.mimetype.clone(),
                url: file.url_private.clone(),
                size: file.size,
            })
        })
        .collect()
}

fn attachment_kind(name: &str) -> Option<AttachmentKind> {
    let (_, ext) = name.rsplit_once('.')?;
    match ext.to_ascii_lowercase().as_str() {
        "png" | "jpg" | "jpeg" | "gif" | "webp" => Some(AttachmentKind::Image),
        "pdf" => Some(AttachmentKind::Pdf),
        _ => None,
    }
}

/// Deterministic conversation id for a channel thread.
///
/// UUID v5 in the DNS namespace over `{team}-{channel}-{thread_ts or "main"}`,
/// so every message in the same thread continues the same session.
pub fn session_id(team_id: &str, channel: &str, thread_ts: Option<&str>) -> Uuid {
    let key = format!("{team_id}-{channel}-{}", thread_ts.unwrap_or("main"));
    Uuid::new_v5(&Uuid::NAMESPACE_DNS, key.as_bytes())
}

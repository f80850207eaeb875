//! Chat platform client used to report task results.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

/// Longest message posted before truncation.
pub const MAX_MESSAGE_CHARS: usize = 39_000;

const TRUNCATION_NOTICE: &str = "\n\n_[Message truncated]_";

/// Reaction while a task is running.
pub const REACTION_PROCESSING: &str = "hourglass_flowing_sand";
/// Reaction once the reply is posted.
pub const REACTION_SUCCESS: &str = "white_check_mark";
/// Reaction after the task was dead-lettered.
pub const REACTION_FAILURE: &str = "x";

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("Platform request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Platform API error: {0}")]
    Api(String),
}

/// Where a message or reaction goes.
#[derive(Debug, Clone, Copy)]
pub struct Target<'a> {
    /// Bot token to act as.
    pub token: &'a str,
    pub channel: &'a str,
}

#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Post `text` in the thread under `thread_ts`. Returns the new message ts.
    async fn post_message(
        &self,
        target: Target<'_>,
        thread_ts: &str,
        text: &str,
    ) -> Result<Option<String>, PlatformError>;

    async fn add_reaction(
        &self,
        target: Target<'_>,
        ts: &str,
        name: &str,
    ) -> Result<(), PlatformError>;

    async fn remove_reaction(
        &self,
        target: Target<'_>,
        ts: &str,
        name: &str,
    ) -> Result<(), PlatformError>;
}

/// Cut `text` to [`MAX_MESSAGE_CHARS`] characters, marking the cut.
pub fn truncate_message(text: &str) -> String {
    match text.char_indices().nth(MAX_MESSAGE_CHARS) {
        Some((byte_idx, _)) => format!("{}{TRUNCATION_NOTICE}", &text[..byte_idx]),
        None => text.to_string(),
    }
}

#[derive(Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    ts: Option<String>,
}

/// Slack Web API client.
#[derive(Debug, Clone)]
pub struct SlackClient {
    http: reqwest::Client,
    base_url: String,
}

impl SlackClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn call(
        &self,
        method: &str,
        token: &str,
        body: serde_json::Value,
    ) -> Result<ApiResponse, PlatformError> {
        let response: ApiResponse = self
            .http
            .post(format!("{}/{method}", self.base_url))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if !response.ok {
            return Err(PlatformError::Api(
                response.error.unwrap_or_else(|| "unknown_error".to_string()),
            ));
        }
        Ok(response)
    }
}

#[async_trait]
impl PlatformClient for SlackClient {
    async fn post_message(
        &self,
        target: Target<'_>,
        thread_ts: &str,
        text: &str,
    ) -> Result<Option<String>, PlatformError> {
        let body = json!({
            "channel": target.channel,
            "thread_ts": thread_ts,
            "text": truncate_message(text),
        });
        Ok(self.call("chat.postMessage", target.token, body).await?.ts)
    }

    async fn add_reaction(
        &self,
        target: Target<'_>,
        ts: &str,
        name: &str,
    ) -> Result<(), PlatformError> {
        let body = json!({"channel": target.channel, "timestamp": ts, "name": name});
        self.call("reactions.add", target.token, body).await.map(|_| ())
    }

    async fn remove_reaction(
        &self,
        target: Target<'_>,
        ts: &str,
        name: &str,
    ) -> Result<(), PlatformError> {
        let body = json!({"channel": target.channel, "timestamp": ts, "name": name});
        self.call("reactions.remove", target.token, body).await.map(|_| ())
    }
}

//! Webhook Handlers

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    routing::post,
    Router,
};

use crate::api::AppState;
use crate::ingest::error::{IngestOutcome, IngestResult};
use crate::ingest::events::InboundEvent;

/// Header carrying the request timestamp (unix seconds).
pub const TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";

/// Header carrying the `v0=` signature.
pub const SIGNATURE_HEADER: &str = "x-slack-signature";

/// Webhook routes.
pub fn router() -> Router<AppState> {
    Router::new().route("/slack", post(slack_webhook))
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Receive a Slack Events API delivery.
///
/// POST /webhooks/slack
///
/// Answers as soon as the event is queued; the automation runs later.
#[tracing::instrument(skip(state, headers, body))]
pub async fn slack_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> IngestResult<IngestOutcome> {
    let inbound = InboundEvent::new(
        body,
        header_value(&headers, TIMESTAMP_HEADER),
        header_value(&headers, SIGNATURE_HEADER),
    );
    state.pipeline.ingest(inbound).await
}

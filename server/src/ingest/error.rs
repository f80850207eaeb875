//! Ingestion Error and Outcome Types

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::dispatch::QueueError;
use crate::ingest::router::IgnoreReason;
use crate::ingest::signing::SignatureError;
use crate::ratelimit::RateLimitError;
use crate::store::StoreError;

/// Ingestion error types.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Signature or timestamp check failed.
    #[error("Request signature rejected: {0}")]
    Unauthenticated(#[from] SignatureError),

    /// Source exceeded its rate limit.
    #[error("Rate limit exceeded, retry after {retry_after}s")]
    Throttled {
        retry_after: u64,
        limit: u32,
        /// Answer with 200 so the platform does not redeliver.
        acknowledge: bool,
    },

    /// Body is not a valid event envelope.
    #[error("Malformed event payload: {0}")]
    Malformed(String),

    /// Shared store unreachable or timed out.
    #[error("Shared store unavailable")]
    StoreUnavailable(#[source] StoreError),

    /// Work queue unreachable or timed out.
    #[error("Task queue unavailable")]
    QueueUnavailable(#[source] QueueError),

    /// The pipeline task died before producing an answer.
    #[error("Internal server error")]
    Internal(String),
}

impl From<StoreError> for IngestError {
    fn from(e: StoreError) -> Self {
        Self::StoreUnavailable(e)
    }
}

impl From<RateLimitError> for IngestError {
    fn from(e: RateLimitError) -> Self {
        match e {
            RateLimitError::StoreUnavailable(e) => Self::StoreUnavailable(e),
        }
    }
}

impl From<QueueError> for IngestError {
    fn from(e: QueueError) -> Self {
        Self::QueueUnavailable(e)
    }
}

impl IngestError {
    /// Outcome label for metrics.
    pub const fn outcome(&self) -> &'static str {
        match self {
            Self::Unauthenticated(_) | Self::Malformed(_) => "rejected",
            Self::Throttled { .. } => "throttled",
            Self::StoreUnavailable(_) | Self::QueueUnavailable(_) | Self::Internal(_) => "failed",
        }
    }
}

/// Error response body for JSON responses.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Machine-readable error code.
    pub error: String,
    /// Human-readable error message.
    pub message: String,
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let (status, code, rate_headers) = match &self {
            Self::Unauthenticated(_) => (StatusCode::UNAUTHORIZED, "INVALID_SIGNATURE", None),
            Self::Throttled {
                retry_after,
                limit,
                acknowledge,
            } => {
                let status = if *acknowledge {
                    StatusCode::OK
                } else {
                    StatusCode::TOO_MANY_REQUESTS
                };
                (status, "RATE_LIMITED", Some((*retry_after, *limit)))
            }
            Self::Malformed(_) => (StatusCode::BAD_REQUEST, "MALFORMED_EVENT", None),
            Self::StoreUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "STORE_UNAVAILABLE", None)
            }
            Self::QueueUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "QUEUE_UNAVAILABLE", None)
            }
            Self::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", None),
        };

        let body = Json(ErrorResponse {
            error: code.to_string(),
            message: self.to_string(),
        });

        let mut response = (status, body).into_response();
        if let Some((retry_after, limit)) = rate_headers {
            let headers = response.headers_mut();
            headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
            headers.insert("X-RateLimit-Limit", HeaderValue::from(limit));
        }
        response
    }
}

/// Successful ingestion results. All answer 200.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A task was queued for the workers.
    Enqueued,
    /// The event identity was already admitted.
    Duplicate,
    /// The event does not warrant dispatch.
    Ignored(IgnoreReason),
    /// `url_verification` handshake; echo the challenge.
    Challenge(String),
}

impl IngestOutcome {
    pub const fn outcome(&self) -> &'static str {
        match self {
            Self::Enqueued => "dispatched",
            Self::Duplicate => "deduplicated",
            Self::Ignored(_) | Self::Challenge(_) => "ignored",
        }
    }
}

#[derive(Serialize)]
struct AcceptedResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

impl IntoResponse for IngestOutcome {
    fn into_response(self) -> Response {
        let (status, reason) = match self {
            Self::Challenge(challenge) => {
                return (
                    StatusCode::OK,
                    [(header::CONTENT_TYPE, "text/plain")],
                    challenge,
                )
                    .into_response();
            }
            Self::Enqueued => ("enqueued", None),
            Self::Duplicate => ("duplicate", None),
            Self::Ignored(reason) => ("ignored", Some(reason.to_string())),
        };

        (StatusCode::OK, Json(AcceptedResponse { status, reason })).into_response()
    }
}

/// Result type for ingestion.
pub type IngestResult<T> = Result<T, IngestError>;

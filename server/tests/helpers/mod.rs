//! Reusable test helpers for HTTP integration tests.
//!
//! Provides `TestApp` for building and sending requests through the full axum
//! router over in-memory backends, plus signed webhook builders.
#![allow(dead_code)]

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{self, Method, Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use sy_server::api::{create_router, AppState};
use sy_server::bots::{BotConfig, BotRegistry};
use sy_server::config::Config;
use sy_server::dispatch::MemoryTaskQueue;
use sy_server::ingest::handlers::{SIGNATURE_HEADER, TIMESTAMP_HEADER};
use sy_server::ingest::sign_request;
use sy_server::store::MemoryStore;
use sy_server::{build_pipeline, Backends};
use tower::ServiceExt;

/// Source id of the bot every test app is configured with.
pub const SOURCE_ID: &str = "A0TEST";
/// Channel the test bot may act in.
pub const CHANNEL: &str = "C0TEST";
/// User id of the test bot itself.
pub const BOT_USER_ID: &str = "U0BOT";

pub fn test_bot() -> BotConfig {
    BotConfig {
        source_id: SOURCE_ID.into(),
        name: "ops".into(),
        bot_user_id: BOT_USER_ID.into(),
        bot_token: "xoxb-test".into(),
        allowed_channels: HashSet::from([CHANNEL.to_string()]),
        working_directory: PathBuf::from("/srv/ops"),
    }
}

pub fn test_bots() -> BotRegistry {
    BotRegistry::from_bots(vec![test_bot()]).expect("valid bot config")
}

pub struct TestApp {
    pub router: Router,
    pub config: Arc<Config>,
    pub store: Arc<MemoryStore>,
    pub queue: Arc<MemoryTaskQueue>,
}

impl TestApp {
    /// Create a new test app over fresh in-memory backends.
    pub fn new() -> Self {
        Self::with_config(Config::default_for_test())
    }

    /// Create a test app with a custom config (for limit testing).
    pub fn with_config(config: Config) -> Self {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryTaskQueue::new());
        let backends = Backends {
            store: store.clone(),
            queue: queue.clone(),
        };

        let pipeline = build_pipeline(&config, &backends, test_bots());
        let state = AppState::new(pipeline, backends.store.clone(), config.clone());

        Self {
            router: create_router(state),
            config: Arc::new(config),
            store,
            queue,
        }
    }

    /// Build an HTTP request with the given method and URI.
    pub fn request(method: Method, uri: &str) -> http::request::Builder {
        Request::builder().method(method).uri(uri)
    }

    /// Build a webhook request signed with the app's secret.
    pub fn signed_webhook(&self, body: &serde_json::Value) -> Request<Body> {
        let body = body.to_string();
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let signature = sign_request(&self.config.signing_secret, &timestamp, body.as_bytes());

        Self::request(Method::POST, "/webhooks/slack")
            .header(http::header::CONTENT_TYPE, "application/json")
            .header(TIMESTAMP_HEADER, timestamp)
            .header(SIGNATURE_HEADER, signature)
            .body(Body::from(body))
            .expect("valid request")
    }

    /// Send a request through the router via `tower::ServiceExt::oneshot`.
    pub async fn oneshot(&self, request: Request<Body>) -> Response<Body> {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("oneshot request failed")
    }
}

/// A user message addressed to the test bot.
pub fn message_event(event_id: &str, user: &str, text: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "event_callback",
        "event_id": event_id,
        "api_app_id": SOURCE_ID,
        "team_id": "T0TEST",
        "event": {
            "type": "message",
            "user": user,
            "channel": CHANNEL,
            "text": text,
            "ts": "1700000000.000100"
        }
    })
}

/// Read a response body into bytes.
pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes()
        .to_vec()
}

/// Read a response body as JSON.
pub async fn body_to_json(response: Response<Body>) -> serde_json::Value {
    let bytes = body_bytes(response).await;
    serde_json::from_slice(&bytes).expect("response body is JSON")
}

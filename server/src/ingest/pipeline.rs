//! Ingestion Pipeline
//!
//! verify → parse → rate limit → dedup claim → route → enqueue.
//!
//! Everything after signature verification runs on its own task so a client
//! that hangs up mid-request cannot leave an event claimed but never queued.

use std::sync::Arc;
use std::time::Instant;

use sy_common::{DispatchTask, EventIdentity};
use tracing::{debug, error, info, warn};

use crate::bots::BotRegistry;
use crate::dispatch::TaskDispatcher;
use crate::ingest::dedup::{ClaimOutcome, Deduplicator};
use crate::ingest::error::{IngestError, IngestOutcome, IngestResult};
use crate::ingest::events::{EventEnvelope, InboundEvent, URL_VERIFICATION};
use crate::ingest::router::{classify, IgnoreReason, Route};
use crate::ingest::signing::SignatureVerifier;
use crate::observability::metrics;
use crate::ratelimit::{Admission, RateLimiter};

#[derive(Clone)]
pub struct IngestPipeline {
    verifier: Arc<SignatureVerifier>,
    limiter: RateLimiter,
    dedup: Deduplicator,
    bots: BotRegistry,
    dispatcher: TaskDispatcher,
}

impl IngestPipeline {
    pub fn new(
        verifier: SignatureVerifier,
        limiter: RateLimiter,
        dedup: Deduplicator,
        bots: BotRegistry,
        dispatcher: TaskDispatcher,
    ) -> Self {
        Self {
            verifier: Arc::new(verifier),
            limiter,
            dedup,
            bots,
            dispatcher,
        }
    }

    /// Run one webhook request through the pipeline.
    pub async fn ingest(&self, inbound: InboundEvent) -> IngestResult<IngestOutcome> {
        let started = Instant::now();
        let result = self.run(inbound).await;

        let outcome = match &result {
            Ok(outcome) => outcome.outcome(),
            Err(e) => e.outcome(),
        };
        metrics::record_event(outcome);
        metrics::record_ingest_duration(started.elapsed().as_secs_f64() * 1000.0);
        result
    }

    async fn run(&self, inbound: InboundEvent) -> IngestResult<IngestOutcome> {
        if let Err(e) = self.verifier.verify(
            inbound.timestamp.as_deref(),
            inbound.signature.as_deref(),
            &inbound.body,
            inbound.received_at,
        ) {
            warn!(error = %e, "Rejected webhook signature");
            return Err(e.into());
        }

        let pipeline = self.clone();
        tokio::spawn(async move { pipeline.admit(inbound).await })
            .await
            .map_err(|e| {
                error!(error = %e, "Ingest task failed");
                IngestError::Internal(e.to_string())
            })?
    }

    /// Post-verification steps. Must run to completion once started.
    async fn admit(&self, inbound: InboundEvent) -> IngestResult<IngestOutcome> {
        let envelope: EventEnvelope = serde_json::from_slice(&inbound.body).map_err(|e| {
            warn!(error = %e, "Malformed webhook body");
            IngestError::Malformed(e.to_string())
        })?;

        if envelope.kind == URL_VERIFICATION {
            info!("URL verification challenge");
            return Ok(IngestOutcome::Challenge(
                envelope.challenge.clone().unwrap_or_default(),
            ));
        }

        let identity = EventIdentity::derive(envelope.event_id.as_deref(), &inbound.body);
        let Some(source_id) = envelope.source_id().map(str::to_string) else {
            debug!(event_identity = %identity, "Event without source id");
            return Ok(IngestOutcome::Ignored(IgnoreReason::UnknownSource));
        };

        match self.limiter.admit(&source_id).await? {
            Admission::Allowed { .. } => metrics::record_admitted(),
            Admission::Throttled { limit, retry_after } => {
                warn!(
                    source_id = %source_id,
                    event_identity = %identity,
                    retry_after,
                    "Source throttled"
                );
                return Err(IngestError::Throttled {
                    retry_after,
                    limit,
                    acknowledge: self.limiter.config().throttle_ack,
                });
            }
        }

        let claim = self.dedup.claim(&identity).await.map_err(|e| {
            warn!(source_id = %source_id, event_identity = %identity, error = %e, "Dedup claim failed");
            IngestError::StoreUnavailable(e)
        })?;
        if claim == ClaimOutcome::AlreadySeen {
            info!(source_id = %source_id, event_identity = %identity, "Duplicate event");
            return Ok(IngestOutcome::Duplicate);
        }

        let Some(bot) = self.bots.get(&source_id) else {
            warn!(source_id = %source_id, event_identity = %identity, "No bot configured for source");
            return Ok(IngestOutcome::Ignored(IgnoreReason::UnknownSource));
        };

        let payload = match classify(&envelope, &bot) {
            Route::Dispatchable(payload) => payload,
            Route::Ignored(reason) => {
                debug!(
                    source_id = %source_id,
                    event_identity = %identity,
                    reason = %reason,
                    "Event ignored"
                );
                return Ok(IngestOutcome::Ignored(reason));
            }
        };

        let task = DispatchTask::new(identity.clone(), source_id.clone(), payload);
        if let Err(e) = self.dispatcher.dispatch(&task).await {
            // Without the claim a redelivery of this event is admitted again.
            if let Err(release_err) = self.dedup.release(&identity).await {
                error!(
                    source_id = %source_id,
                    event_identity = %identity,
                    error = %release_err,
                    "Failed to release dedup claim after enqueue failure"
                );
            }
            return Err(IngestError::QueueUnavailable(e));
        }

        info!(
            source_id = %source_id,
            event_identity = %identity,
            task_id = %task.task_id,
            bot = %bot.name,
            "Event dispatched"
        );
        Ok(IngestOutcome::Enqueued)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::time::Duration;

    use bytes::Bytes;
    use chrono::Utc;

    use super::*;
    use crate::bots::BotConfig;
    use crate::dispatch::{MemoryTaskQueue, DEFAULT_ENQUEUE_TIMEOUT};
    use crate::ingest::signing::sign_request;
    use crate::ratelimit::{LimitConfig, RateLimitConfig};
    use crate::store::MemoryStore;

    const SECRET: &str = "test-signing-secret";

    struct Harness {
        store: Arc<MemoryStore>,
        queue: Arc<MemoryTaskQueue>,
        pipeline: IngestPipeline,
    }

    fn harness(limit: u32) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryTaskQueue::new());
        let bots = BotRegistry::from_bots(vec![BotConfig {
            source_id: "A1".into(),
            name: "ops".into(),
            bot_user_id: "UBOT".into(),
            bot_token: "xoxb-test".into(),
            allowed_channels: HashSet::from(["C1".to_string()]),
            working_directory: PathBuf::from("/srv/ops"),
        }])
        .unwrap();
        let limiter = RateLimiter::new(
            store.clone(),
            RateLimitConfig {
                default_limit: LimitConfig {
                    requests: limit,
                    window_secs: 60,
                },
                ..Default::default()
            },
        );
        let pipeline = IngestPipeline::new(
            SignatureVerifier::new(SECRET, 300),
            limiter,
            Deduplicator::new(store.clone(), "test", Duration::from_secs(3600)),
            bots,
            TaskDispatcher::new(queue.clone(), DEFAULT_ENQUEUE_TIMEOUT),
        );
        Harness {
            store,
            queue,
            pipeline,
        }
    }

    fn signed(body: serde_json::Value) -> InboundEvent {
        let body = Bytes::from(body.to_string());
        let ts = Utc::now().timestamp().to_string();
        let signature = sign_request(SECRET, &ts, &body);
        InboundEvent::new(body, Some(ts), Some(signature))
    }

    fn message(event_id: &str, user: &str) -> serde_json::Value {
        serde_json::json!({
            "type": "event_callback",
            "event_id": event_id,
            "api_app_id": "A1",
            "team_id": "T1",
            "event": {"type": "message", "user": user, "channel": "C1", "text": "run it", "ts": "1.0"}
        })
    }

    #[tokio::test]
    async fn enqueues_once_then_duplicate() {
        let h = harness(10);

        let first = h.pipeline.ingest(signed(message("Ev1", "U1"))).await.unwrap();
        assert_eq!(first, IngestOutcome::Enqueued);

        let again = h.pipeline.ingest(signed(message("Ev1", "U1"))).await.unwrap();
        assert_eq!(again, IngestOutcome::Duplicate);

        let tasks = h.queue.ready_tasks().await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].source_id, "A1");
        assert_eq!(tasks[0].payload.text, "run it");
    }

    #[tokio::test]
    async fn bad_signature_is_rejected_before_any_state() {
        let h = harness(10);
        let mut inbound = signed(message("Ev1", "U1"));
        inbound.signature = Some("v0=deadbeef".into());

        let err = h.pipeline.ingest(inbound).await.unwrap_err();
        assert!(matches!(err, IngestError::Unauthenticated(_)));
        assert!(!h.store.contains("test:dedup:Ev1"));
    }

    #[tokio::test]
    async fn throttles_after_limit() {
        let h = harness(2);
        for i in 0..2 {
            let outcome = h
                .pipeline
                .ingest(signed(message(&format!("Ev{i}"), "U1")))
                .await
                .unwrap();
            assert_eq!(outcome, IngestOutcome::Enqueued);
        }

        let err = h.pipeline.ingest(signed(message("Ev9", "U1"))).await.unwrap_err();
        assert!(matches!(err, IngestError::Throttled { limit: 2, acknowledge: false, .. }));
        assert!(!h.store.contains("test:dedup:Ev9"), "throttled events are not claimed");
    }

    #[tokio::test]
    async fn self_authored_is_ignored() {
        let h = harness(10);
        let outcome = h.pipeline.ingest(signed(message("Ev1", "UBOT"))).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Ignored(IgnoreReason::SelfAuthored));
        assert_eq!(h.queue.ready_len().await, 0);
    }

    #[tokio::test]
    async fn enqueue_failure_releases_claim() {
        let h = harness(10);
        h.queue.set_unavailable(true);

        let err = h.pipeline.ingest(signed(message("Ev1", "U1"))).await.unwrap_err();
        assert!(matches!(err, IngestError::QueueUnavailable(_)));
        assert!(!h.store.contains("test:dedup:Ev1"));

        h.queue.set_unavailable(false);
        let outcome = h.pipeline.ingest(signed(message("Ev1", "U1"))).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Enqueued);
    }

    #[tokio::test]
    async fn malformed_and_challenge() {
        let h = harness(10);

        let body = Bytes::from_static(b"{not json");
        let ts = Utc::now().timestamp().to_string();
        let sig = sign_request(SECRET, &ts, &body);
        let err = h
            .pipeline
            .ingest(InboundEvent::new(body, Some(ts), Some(sig)))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Malformed(_)));

        let outcome = h
            .pipeline
            .ingest(signed(serde_json::json!({"type": "url_verification", "challenge": "xyz"})))
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Challenge("xyz".into()));
    }

    #[tokio::test]
    async fn unknown_source_is_ignored() {
        let h = harness(10);
        let mut body = message("Ev1", "U1");
        body["api_app_id"] = "A404".into();

        let outcome = h.pipeline.ingest(signed(body)).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Ignored(IgnoreReason::UnknownSource));
        assert_eq!(h.queue.ready_len().await, 0);
    }

    #[tokio::test]
    async fn missing_event_id_uses_content_hash() {
        let h = harness(10);
        let mut body = message("", "U1");
        body.as_object_mut().unwrap().remove("event_id");

        let outcome = h.pipeline.ingest(signed(body)).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Enqueued);
        assert!(h.queue.ready_tasks().await[0].event_identity.is_content_hash());
    }

    #[tokio::test]
    async fn dropped_request_still_claims_and_enqueues() {
        let h = harness(10);

        // First poll verifies and hands off; the caller then goes away.
        let dropped =
            tokio::time::timeout(Duration::ZERO, h.pipeline.ingest(signed(message("Ev1", "U1"))))
                .await;
        assert!(dropped.is_err(), "request future should still be pending");

        for _ in 0..100 {
            if h.queue.ready_len().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.queue.ready_len().await, 1);
        assert!(h.store.contains("test:dedup:Ev1"));

        let retry = h.pipeline.ingest(signed(message("Ev1", "U1"))).await.unwrap();
        assert_eq!(retry, IngestOutcome::Duplicate);
        assert_eq!(h.queue.ready_len().await, 1);
    }

    #[tokio::test]
    async fn dedup_store_outage_is_unavailable() {
        let h = harness(10);
        h.store.set_unavailable(true);

        // Limiter fails open; the claim cannot.
        let err = h.pipeline.ingest(signed(message("Ev1", "U1"))).await.unwrap_err();
        assert!(matches!(err, IngestError::StoreUnavailable(_)));
        assert_eq!(h.queue.ready_len().await, 0);
    }
}

//! Switchyard Server
//!
//! Receives chat platform webhooks, admits each event at most once under a
//! per-source rate limit, and hands accepted events to background workers
//! that run the configured automation.

pub mod api;
pub mod bots;
pub mod config;
pub mod dispatch;
pub mod ingest;
pub mod observability;
pub mod ratelimit;
pub mod store;
pub mod worker;


use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bots::BotRegistry;
use crate::config::{Config, StoreBackend};
use crate::dispatch::{MemoryTaskQueue, RedisTaskQueue, TaskDispatcher, TaskQueue};
use crate::ingest::{Deduplicator, IngestPipeline, SignatureVerifier};
use crate::ratelimit::RateLimiter;
use crate::store::{MemoryStore, RedisStore, SharedStore};

/// How often the in-memory store drops expired windows and claims.
pub const STORE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Shared store and task queue for one deployment.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn SharedStore>,
    pub queue: Arc<dyn TaskQueue>,
}

impl Backends {
    /// In-process store and queue.
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            queue: Arc::new(MemoryTaskQueue::new()),
        }
    }

    /// Connect the backend selected by `config.store_backend`. The in-memory
    /// store gets a sweeper that stops with `shutdown`.
    pub async fn connect(config: &Config, shutdown: &CancellationToken) -> anyhow::Result<Self> {
        match config.store_backend {
            StoreBackend::Memory => {
                info!("Using in-memory store and queue (single instance only)");
                let store = Arc::new(MemoryStore::new());
                store.clone().spawn_sweeper(STORE_SWEEP_INTERVAL, shutdown.clone());
                Ok(Self {
                    store,
                    queue: Arc::new(MemoryTaskQueue::new()),
                })
            }
            StoreBackend::Redis => {
                let redis = store::create_redis_client(&config.redis_url).await?;
                let store = RedisStore::new(redis.clone(), config.store_timeout);
                store.init().await?;
                Ok(Self {
                    store: Arc::new(store),
                    queue: Arc::new(RedisTaskQueue::new(redis, &config.key_prefix)),
                })
            }
        }
    }
}

/// Wire the ingestion pipeline from configuration.
pub fn build_pipeline(config: &Config, backends: &Backends, bots: BotRegistry) -> IngestPipeline {
    IngestPipeline::new(
        SignatureVerifier::new(config.signing_secret.clone(), config.max_skew_secs),
        RateLimiter::new(backends.store.clone(), config.rate_limit.clone()),
        Deduplicator::new(backends.store.clone(), config.key_prefix.clone(), config.dedup_ttl),
        bots,
        TaskDispatcher::new(backends.queue.clone(), config.enqueue_timeout),
    )
}

//! Server Configuration
//!
//! Loads configuration from environment variables.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::ratelimit::RateLimitConfig;
use crate::worker::WorkerConfig;

/// Where the rate-limit counters, dedup records and queue live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// Shared Redis; required when running more than one instance.
    Redis,
    /// Process memory; single instance only.
    Memory,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(Self::Redis),
            "memory" => Ok(Self::Memory),
            other => anyhow::bail!("unknown STORE_BACKEND '{other}' (expected redis or memory)"),
        }
    }
}

/// Server configuration loaded from environment variables.
#[derive(Clone)]
pub struct Config {
    /// Server bind address (e.g., "0.0.0.0:8080")
    pub bind_address: String,

    /// Shared state backend (default: redis)
    pub store_backend: StoreBackend,

    /// Redis connection URL
    pub redis_url: String,

    /// Prefix for every shared store and queue key
    pub key_prefix: String,

    /// Webhook signing secret. Required; requests are never accepted unsigned.
    pub signing_secret: String,

    /// Allowed clock skew for request timestamps in seconds (default: 300)
    pub max_skew_secs: u64,

    /// Retention of dedup records (default: 6 hours)
    pub dedup_ttl: Duration,

    /// Deadline for a single shared store operation (default: 500ms)
    pub store_timeout: Duration,

    /// Deadline for a single enqueue (default: 1s)
    pub enqueue_timeout: Duration,

    /// Largest accepted webhook body in bytes (default: 1MB)
    pub max_body_bytes: usize,

    /// Path of the bots JSON file
    pub bots_config_path: PathBuf,

    /// Automation program
    pub automation_program: String,

    /// Arguments placed before the per-task arguments
    pub automation_args: Vec<String>,

    /// Wall-clock limit for one automation run (default: 600s)
    pub automation_timeout: Duration,

    /// Slack Web API base URL
    pub slack_api_base: String,

    /// Rate limiting
    pub rate_limit: RateLimitConfig,

    /// Worker pool
    pub worker: WorkerConfig,
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let worker = WorkerConfig {
            concurrency: env_or("WORKER_CONCURRENCY", 4),
            poll_interval: Duration::from_millis(env_or("WORKER_POLL_INTERVAL_MS", 500)),
            visibility_timeout: Duration::from_secs(env_or("TASK_VISIBILITY_TIMEOUT_SECS", 900)),
            max_attempts: env_or("WORKER_MAX_ATTEMPTS", 3),
            retry_base: Duration::from_secs(env_or("WORKER_RETRY_BASE_SECS", 5)),
            retry_cap: Duration::from_secs(env_or("WORKER_RETRY_CAP_SECS", 600)),
        };

        let config = Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".into()),
            store_backend: match env::var("STORE_BACKEND") {
                Ok(v) => v.parse()?,
                Err(_) => StoreBackend::Redis,
            },
            redis_url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into()),
            key_prefix: env::var("KEY_PREFIX").unwrap_or_else(|_| "switchyard".into()),
            signing_secret: env::var("SLACK_SIGNING_SECRET")
                .context("SLACK_SIGNING_SECRET must be set")?,
            max_skew_secs: env_or("SIGNATURE_MAX_SKEW_SECS", 300),
            dedup_ttl: Duration::from_secs(env_or("DEDUP_TTL_SECS", 6 * 60 * 60)),
            store_timeout: Duration::from_millis(env_or("STORE_TIMEOUT_MS", 500)),
            enqueue_timeout: Duration::from_millis(env_or("ENQUEUE_TIMEOUT_MS", 1000)),
            max_body_bytes: env_or("MAX_BODY_BYTES", 1024 * 1024),
            bots_config_path: env::var("BOTS_CONFIG_PATH")
                .unwrap_or_else(|_| "bots.json".into())
                .into(),
            automation_program: env::var("AUTOMATION_PROGRAM").unwrap_or_else(|_| "claude".into()),
            automation_args: env::var("AUTOMATION_ARGS")
                .unwrap_or_else(|_| "--output-format stream-json --verbose".into())
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            automation_timeout: Duration::from_secs(env_or("AUTOMATION_TIMEOUT_SECS", 600)),
            slack_api_base: env::var("SLACK_API_BASE")
                .unwrap_or_else(|_| "https://slack.com/api".into()),
            rate_limit: RateLimitConfig::from_env(),
            worker,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that would break delivery guarantees.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.signing_secret.trim().is_empty(),
            "SLACK_SIGNING_SECRET must not be empty"
        );
        anyhow::ensure!(
            self.worker.visibility_timeout > self.automation_timeout,
            "TASK_VISIBILITY_TIMEOUT_SECS ({:?}) must exceed AUTOMATION_TIMEOUT_SECS ({:?})",
            self.worker.visibility_timeout,
            self.automation_timeout
        );
        anyhow::ensure!(self.worker.max_attempts >= 1, "WORKER_MAX_ATTEMPTS must be at least 1");
        anyhow::ensure!(self.worker.concurrency >= 1, "WORKER_CONCURRENCY must be at least 1");
        Ok(())
    }

    /// Create a default configuration for testing.
    pub fn default_for_test() -> Self {
        Self {
            bind_address: "127.0.0.1:0".into(),
            store_backend: StoreBackend::Memory,
            redis_url: "redis://localhost:6379".into(),
            key_prefix: "switchyard-test".into(),
            signing_secret: "test-signing-secret".into(),
            max_skew_secs: 300,
            dedup_ttl: Duration::from_secs(6 * 60 * 60),
            store_timeout: Duration::from_millis(500),
            enqueue_timeout: Duration::from_secs(1),
            max_body_bytes: 1024 * 1024,
            bots_config_path: "bots.json".into(),
            automation_program: "true".into(),
            automation_args: vec![],
            automation_timeout: Duration::from_secs(5),
            slack_api_base: "http://127.0.0.1:9/api".into(),
            rate_limit: RateLimitConfig::default(),
            worker: WorkerConfig {
                visibility_timeout: Duration::from_secs(30),
                ..WorkerConfig::default()
            },
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("store_backend", &self.store_backend)
            .field("key_prefix", &self.key_prefix)
            .field("signing_secret", &"[REDACTED]")
            .field("max_skew_secs", &self.max_skew_secs)
            .field("dedup_ttl", &self.dedup_ttl)
            .field("bots_config_path", &self.bots_config_path)
            .field("automation_program", &self.automation_program)
            .field("automation_timeout", &self.automation_timeout)
            .field("rate_limit", &self.rate_limit)
            .field("worker", &self.worker)
            .finish_non_exhaustive()
    }
}

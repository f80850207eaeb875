//! Redis-backed shared store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fred::interfaces::{KeysInterface, LuaInterface};
use fred::prelude::*;
use fred::types::FromValue;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::{with_deadline, SharedStore, StoreError, WindowCount};

/// Atomic fixed-window increment.
///
/// Starts the window expiry on the first hit and repairs keys that somehow
/// lost their TTL, so a counter can never outlive its window.
const WINDOW_SCRIPT: &str = r"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
    ttl = tonumber(ARGV[1])
end
return {count, ttl}
";

/// Conditional insert with expiry. Returns 1 when the key was created.
const CLAIM_SCRIPT: &str = r"
if redis.call('SET', KEYS[1], ARGV[1], 'NX', 'PX', ARGV[2]) then
    return 1
end
return 0
";

const PING_SCRIPT: &str = "return redis.call('PING')";

/// Lua script return code for a successful claim.
const SCRIPT_CLAIMED: i64 = 1;

/// Script SHAs for Lua scripts loaded in Redis.
#[derive(Clone, Default)]
struct ScriptShas {
    window: String,
    claim: String,
}

/// Create Redis client.
pub async fn create_redis_client(redis_url: &str) -> anyhow::Result<Client> {
    let config = Config::from_url(redis_url)?;
    let client = Client::new(config, None, None, None);
    client.connect();
    client.wait_for_connect().await?;

    info!("Connected to Redis");
    Ok(client)
}

/// [`SharedStore`] on Redis, using Lua scripts for every read-modify-write.
#[derive(Clone)]
pub struct RedisStore {
    redis: Client,
    op_timeout: Duration,
    scripts: Arc<RwLock<ScriptShas>>,
}

impl RedisStore {
    /// Creates a new store. Call `init()` before use to load the Lua scripts.
    pub fn new(redis: Client, op_timeout: Duration) -> Self {
        Self {
            redis,
            op_timeout,
            scripts: Arc::new(RwLock::new(ScriptShas::default())),
        }
    }

    /// Loads the Lua scripts into Redis.
    pub async fn init(&self) -> Result<(), Error> {
        self.load_scripts().await
    }

    /// Loads or reloads Lua scripts into Redis.
    ///
    /// Called during init and when NOSCRIPT errors are encountered.
    async fn load_scripts(&self) -> Result<(), Error> {
        let window_sha: String = self.redis.script_load(WINDOW_SCRIPT).await?;
        let claim_sha: String = self.redis.script_load(CLAIM_SCRIPT).await?;

        info!(
            window_sha = %window_sha,
            claim_sha = %claim_sha,
            "Lua scripts loaded into Redis"
        );

        let mut scripts = self.scripts.write().await;
        scripts.window = window_sha;
        scripts.claim = claim_sha;
        Ok(())
    }

    /// Checks if an error is a NOSCRIPT error (script not found in Redis).
    fn is_noscript_error(error: &Error) -> bool {
        error.to_string().contains("NOSCRIPT")
    }

    /// Runs a loaded script by SHA, reloading once on NOSCRIPT.
    async fn run_script<R: FromValue>(
        &self,
        select: fn(&ScriptShas) -> String,
        key: &str,
        args: Vec<String>,
    ) -> Result<R, StoreError> {
        let sha = select(&*self.scripts.read().await);

        let result: Result<R, Error> = self.redis.evalsha(&sha, vec![key], args.clone()).await;

        match result {
            Ok(value) => Ok(value),
            Err(e) if Self::is_noscript_error(&e) => {
                warn!("NOSCRIPT error, reloading Lua scripts");
                self.load_scripts().await.map_err(|e| {
                    warn!(error = %e, "Failed to reload scripts");
                    StoreError::Unavailable(e.to_string())
                })?;

                let new_sha = select(&*self.scripts.read().await);
                self.redis
                    .evalsha(&new_sha, vec![key], args)
                    .await
                    .map_err(|e| StoreError::Unavailable(e.to_string()))
            }
            Err(e) => Err(StoreError::Unavailable(e.to_string())),
        }
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn increment_window(
        &self,
        key: &str,
        window: Duration,
    ) -> Result<WindowCount, StoreError> {
        let window_ms = window.as_millis().max(1).to_string();
        let reply: Vec<i64> = with_deadline(
            self.op_timeout,
            self.run_script(|s| s.window.clone(), key, vec![window_ms]),
        )
        .await?;

        let count = reply.first().copied().unwrap_or_default().max(0) as u64;
        let ttl_ms = reply.get(1).copied().unwrap_or_default().max(0) as u64;

        Ok(WindowCount {
            count,
            resets_in: Duration::from_millis(ttl_ms),
        })
    }

    async fn insert_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let ttl_ms = ttl.as_millis().max(1).to_string();
        let reply: i64 = with_deadline(
            self.op_timeout,
            self.run_script(|s| s.claim.clone(), key, vec![value.to_string(), ttl_ms]),
        )
        .await?;

        Ok(reply == SCRIPT_CLAIMED)
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        with_deadline(self.op_timeout, async {
            self.redis
                .del::<i64, _>(key)
                .await
                .map(|_| ())
                .map_err(|e| StoreError::Unavailable(e.to_string()))
        })
        .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        with_deadline(self.op_timeout, async {
            self.redis
                .eval::<String, _, _, _>(PING_SCRIPT, Vec::<String>::new(), Vec::<String>::new())
                .await
                .map(|_| ())
                .map_err(|e| StoreError::Unavailable(e.to_string()))
        })
        .await
    }
}

//! Redis task queue.
//!
//! Layout under `{prefix}:queue:`:
//! - `ready`: list of encoded tasks (LPUSH producers, RPOP consumers).
//! - `retry`: sorted set of failed tasks, score = due time in ms.
//! - `inflight`: sorted set of claim tokens, score = visibility deadline in ms.
//! - `claims`: hash of claim token to encoded task.
//! - `dead`: list of failure records.
//!
//! Every claim gets a fresh token, so a worker whose claim expired and was
//! handed to another worker cannot settle the new claim. Every multi-key step
//! runs as one Lua script so concurrent workers never claim or settle the same
//! task twice.

use std::time::Duration;

use async_trait::async_trait;
use fred::interfaces::{ListInterface, LuaInterface, SortedSetsInterface};
use fred::prelude::*;
use sy_common::{DispatchTask, FailureRecord};
use tracing::{error, warn};
use uuid::Uuid;

use super::{ClaimedTask, QueueError, TaskQueue};

/// Promote due retries and expired claims, then claim one ready task under
/// the token in `ARGV[3]`.
const DEQUEUE_LUA: &str = r"
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1], 'LIMIT', 0, 50)
for _, item in ipairs(due) do
    redis.call('ZREM', KEYS[2], item)
    redis.call('LPUSH', KEYS[1], item)
end
local expired = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', ARGV[1], 'LIMIT', 0, 50)
for _, token in ipairs(expired) do
    redis.call('ZREM', KEYS[3], token)
    local payload = redis.call('HGET', KEYS[4], token)
    redis.call('HDEL', KEYS[4], token)
    if payload then
        redis.call('LPUSH', KEYS[1], payload)
    end
end
local item = redis.call('RPOP', KEYS[1])
if not item then
    return false
end
redis.call('ZADD', KEYS[3], ARGV[2], ARGV[3])
redis.call('HSET', KEYS[4], ARGV[3], item)
return item
";

/// Drop a claim. Returns 0 if the claim was lost.
const ACK_LUA: &str = r"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
    return 0
end
redis.call('HDEL', KEYS[2], ARGV[1])
return 1
";

/// Move a claimed task to the retry set. Returns 0 if the claim was lost.
const NACK_LUA: &str = r"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
    return 0
end
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('ZADD', KEYS[3], ARGV[2], ARGV[3])
return 1
";

/// Replace a claimed task with its failure record. Returns 0 if the claim was lost.
const DEAD_LETTER_LUA: &str = r"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
    return 0
end
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('LPUSH', KEYS[3], ARGV[2])
return 1
";

#[derive(Clone)]
pub struct RedisTaskQueue {
    redis: Client,
    ready_key: String,
    retry_key: String,
    inflight_key: String,
    claims_key: String,
    dead_key: String,
}

fn unavailable(e: Error) -> QueueError {
    QueueError::Unavailable(e.to_string())
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn after_ms(delay: Duration) -> i64 {
    now_ms().saturating_add(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX))
}

impl RedisTaskQueue {
    pub fn new(redis: Client, prefix: &str) -> Self {
        Self {
            redis,
            ready_key: format!("{prefix}:queue:ready"),
            retry_key: format!("{prefix}:queue:retry"),
            inflight_key: format!("{prefix}:queue:inflight"),
            claims_key: format!("{prefix}:queue:claims"),
            dead_key: format!("{prefix}:queue:dead"),
        }
    }

    /// Number of tasks waiting in the ready list.
    pub async fn ready_len(&self) -> Result<usize, QueueError> {
        self.redis.llen(self.ready_key.as_str()).await.map_err(unavailable)
    }

    /// Number of failure records parked in the dead-letter list.
    pub async fn dead_len(&self) -> Result<usize, QueueError> {
        self.redis.llen(self.dead_key.as_str()).await.map_err(unavailable)
    }

    /// Number of claimed, unsettled tasks.
    pub async fn inflight_len(&self) -> Result<usize, QueueError> {
        self.redis.zcard(self.inflight_key.as_str()).await.map_err(unavailable)
    }

    /// Run a settle script for `claimed`. Returns whether the claim was still held.
    async fn settle(
        &self,
        script: &str,
        claimed: &ClaimedTask,
        target_key: Option<&str>,
        extra: Vec<String>,
    ) -> Result<bool, QueueError> {
        let mut keys = vec![self.inflight_key.as_str(), self.claims_key.as_str()];
        keys.extend(target_key);
        let mut args = vec![claimed.receipt.clone()];
        args.extend(extra);

        let moved: i64 = self
            .redis
            .eval(script, keys, args)
            .await
            .map_err(unavailable)?;
        Ok(moved == 1)
    }

    /// Number of tasks waiting for a retry.
    pub async fn retry_len(&self) -> Result<usize, QueueError> {
        self.redis.zcard(self.retry_key.as_str()).await.map_err(unavailable)
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn enqueue(&self, task: &DispatchTask) -> Result<(), QueueError> {
        let payload = task.encode()?;
        self.redis
            .lpush::<(), _, _>(self.ready_key.as_str(), payload)
            .await
            .map_err(unavailable)
    }

    async fn dequeue(&self, visibility: Duration) -> Result<Option<ClaimedTask>, QueueError> {
        loop {
            let token = Uuid::now_v7().to_string();
            let item: Option<String> = self
                .redis
                .eval(
                    DEQUEUE_LUA,
                    vec![
                        self.ready_key.as_str(),
                        self.retry_key.as_str(),
                        self.inflight_key.as_str(),
                        self.claims_key.as_str(),
                    ],
                    vec![
                        now_ms().to_string(),
                        after_ms(visibility).to_string(),
                        token.clone(),
                    ],
                )
                .await
                .map_err(unavailable)?;

            let Some(raw) = item else {
                return Ok(None);
            };

            match DispatchTask::decode(&raw) {
                Ok(task) => {
                    return Ok(Some(ClaimedTask {
                        task,
                        receipt: token,
                    }))
                }
                Err(e) => {
                    let truncated: String = raw.chars().take(500).collect();
                    error!(error = %e, payload_preview = %truncated, "Dropping undecodable task");
                    self.redis
                        .eval::<i64, _, _, _>(
                            ACK_LUA,
                            vec![self.inflight_key.as_str(), self.claims_key.as_str()],
                            vec![token],
                        )
                        .await
                        .map_err(unavailable)?;
                }
            }
        }
    }

    async fn ack(&self, claimed: &ClaimedTask) -> Result<(), QueueError> {
        if !self.settle(ACK_LUA, claimed, None, vec![]).await? {
            warn!(task_id = %claimed.task.task_id, "Ack for a claim that already expired");
        }
        Ok(())
    }

    async fn nack(&self, claimed: &ClaimedTask, retry_after: Duration) -> Result<(), QueueError> {
        let next = claimed.task.next_attempt().encode()?;
        let held = self
            .settle(
                NACK_LUA,
                claimed,
                Some(self.retry_key.as_str()),
                vec![after_ms(retry_after).to_string(), next],
            )
            .await?;
        if !held {
            warn!(task_id = %claimed.task.task_id, "Nack for a claim that already expired");
        }
        Ok(())
    }

    async fn dead_letter(
        &self,
        claimed: &ClaimedTask,
        record: &FailureRecord,
    ) -> Result<(), QueueError> {
        let record = serde_json::to_string(record)
            .map_err(|e| QueueError::Encoding(sy_common::Error::Encoding(e)))?;
        let held = self
            .settle(DEAD_LETTER_LUA, claimed, Some(self.dead_key.as_str()), vec![record])
            .await?;
        if !held {
            warn!(task_id = %claimed.task.task_id, "Dead-letter for a claim that already expired");
        }
        Ok(())
    }
}

//! Task Dispatch
//!
//! The boundary between ingestion and the workers. Producers push a
//! [`DispatchTask`] and return; consumers claim tasks with a visibility
//! deadline and settle each one with `ack`, `nack` or `dead_letter`.
//!
//! Delivery is at-least-once: a claimed task that is never settled becomes
//! visible again once its deadline passes.

pub mod memory;
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sy_common::{DispatchTask, FailureRecord};
use thiserror::Error;
use tracing::{info, warn};

pub use memory::MemoryTaskQueue;
pub use redis::RedisTaskQueue;

/// Default bound on a single enqueue.
pub const DEFAULT_ENQUEUE_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors from the task queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Task queue unavailable: {0}")]
    Unavailable(String),
    #[error("Task queue timed out after {0:?}")]
    Timeout(Duration),
    #[error("Task encoding failed: {0}")]
    Encoding(#[from] sy_common::Error),
}

/// A task taken off the queue, with the receipt that settles it.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub task: DispatchTask,
    /// Token unique to this claim. Settling with a token whose claim expired
    /// and was handed out again is a no-op.
    pub receipt: String,
}

/// Durable work queue shared by producers and consumers.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Make `task` available to consumers.
    async fn enqueue(&self, task: &DispatchTask) -> Result<(), QueueError>;

    /// Claim the next ready task, hiding it from other consumers for
    /// `visibility`. Due retries and expired claims are made ready first.
    async fn dequeue(&self, visibility: Duration) -> Result<Option<ClaimedTask>, QueueError>;

    /// Task finished; forget it.
    async fn ack(&self, claimed: &ClaimedTask) -> Result<(), QueueError>;

    /// Task failed; schedule it again after `retry_after` with its attempt
    /// counter advanced.
    async fn nack(&self, claimed: &ClaimedTask, retry_after: Duration) -> Result<(), QueueError>;

    /// Task exhausted its attempts; park a failure record instead.
    async fn dead_letter(
        &self,
        claimed: &ClaimedTask,
        record: &FailureRecord,
    ) -> Result<(), QueueError>;
}

/// Producer side used by the ingestion pipeline.
#[derive(Clone)]
pub struct TaskDispatcher {
    queue: Arc<dyn TaskQueue>,
    timeout: Duration,
}

impl TaskDispatcher {
    pub fn new(queue: Arc<dyn TaskQueue>, timeout: Duration) -> Self {
        Self { queue, timeout }
    }

    /// Push `task`, failing fast if the queue does not answer in time.
    #[tracing::instrument(skip(self, task), fields(task_id = %task.task_id, event_identity = %task.event_identity))]
    pub async fn dispatch(&self, task: &DispatchTask) -> Result<(), QueueError> {
        match tokio::time::timeout(self.timeout, self.queue.enqueue(task)).await {
            Ok(Ok(())) => {
                info!(source_id = %task.source_id, "Task enqueued");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(source_id = %task.source_id, error = %e, "Failed to enqueue task");
                Err(e)
            }
            Err(_) => {
                warn!(source_id = %task.source_id, timeout = ?self.timeout, "Enqueue timed out");
                Err(QueueError::Timeout(self.timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use sy_common::{EventIdentity, TaskPayload};
    use uuid::Uuid;

    use super::*;

    pub(crate) fn sample_task(event_id: &str) -> DispatchTask {
        DispatchTask::new(
            EventIdentity::new(event_id).unwrap(),
            "A1",
            TaskPayload {
                channel: "C1".into(),
                user: "U1".into(),
                text: "hello".into(),
                ts: "1.0".into(),
                thread_ts: None,
                files: vec![],
                session_id: Uuid::nil(),
            },
        )
    }

    #[tokio::test]
    async fn dispatch_pushes_to_queue() {
        let queue = Arc::new(MemoryTaskQueue::new());
        let dispatcher = TaskDispatcher::new(queue.clone(), DEFAULT_ENQUEUE_TIMEOUT);

        dispatcher.dispatch(&sample_task("Ev1")).await.unwrap();
        assert_eq!(queue.ready_len().await, 1);
    }

    #[tokio::test]
    async fn dispatch_reports_outage() {
        let queue = Arc::new(MemoryTaskQueue::new());
        queue.set_unavailable(true);
        let dispatcher = TaskDispatcher::new(queue.clone(), DEFAULT_ENQUEUE_TIMEOUT);

        assert!(matches!(
            dispatcher.dispatch(&sample_task("Ev1")).await,
            Err(QueueError::Unavailable(_))
        ));
    }
}

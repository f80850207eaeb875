//! In-process task queue.
//!
//! Same settle semantics as the Redis queue, for single-instance runs and
//! tests. Deadlines use `tokio::time::Instant` so a paused clock drives
//! retries and visibility expiry.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sy_common::{DispatchTask, FailureRecord};
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use super::{ClaimedTask, QueueError, TaskQueue};

#[derive(Default)]
struct QueueState {
    ready: VecDeque<String>,
    retry: Vec<(Instant, String)>,
    /// Claim token to (visibility deadline, encoded task).
    inflight: HashMap<String, (Instant, String)>,
    dead: Vec<FailureRecord>,
}

impl QueueState {
    /// Move due retries and expired claims back to ready.
    fn promote(&mut self, now: Instant) {
        let (due, waiting): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.retry).into_iter().partition(|(at, _)| *at <= now);
        self.retry = waiting;
        for (_, item) in due {
            self.ready.push_front(item);
        }

        let expired: Vec<String> = self
            .inflight
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(token, _)| token.clone())
            .collect();
        for token in expired {
            if let Some((_, item)) = self.inflight.remove(&token) {
                self.ready.push_front(item);
            }
        }
    }
}

/// [`TaskQueue`] held in process memory.
#[derive(Default)]
pub struct MemoryTaskQueue {
    state: Mutex<QueueState>,
    unavailable: AtomicBool,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a broker outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn ready_len(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    pub async fn retry_len(&self) -> usize {
        self.state.lock().await.retry.len()
    }

    pub async fn inflight_len(&self) -> usize {
        self.state.lock().await.inflight.len()
    }

    /// Tasks waiting in the ready list, oldest first.
    pub async fn ready_tasks(&self) -> Vec<DispatchTask> {
        self.state
            .lock()
            .await
            .ready
            .iter()
            .rev()
            .filter_map(|raw| DispatchTask::decode(raw).ok())
            .collect()
    }

    pub async fn dead_letters(&self) -> Vec<FailureRecord> {
        self.state.lock().await.dead.clone()
    }

    fn check_available(&self) -> Result<(), QueueError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("memory queue marked unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue(&self, task: &DispatchTask) -> Result<(), QueueError> {
        self.check_available()?;
        let payload = task.encode()?;
        self.state.lock().await.ready.push_front(payload);
        Ok(())
    }

    async fn dequeue(&self, visibility: Duration) -> Result<Option<ClaimedTask>, QueueError> {
        self.check_available()?;
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.promote(now);

        while let Some(raw) = state.ready.pop_back() {
            match DispatchTask::decode(&raw) {
                Ok(task) => {
                    let token = Uuid::now_v7().to_string();
                    state.inflight.insert(token.clone(), (now + visibility, raw));
                    return Ok(Some(ClaimedTask {
                        task,
                        receipt: token,
                    }));
                }
                Err(e) => {
                    tracing::error!(error = %e, "Dropping undecodable task");
                }
            }
        }
        Ok(None)
    }

    async fn ack(&self, claimed: &ClaimedTask) -> Result<(), QueueError> {
        self.check_available()?;
        self.state.lock().await.inflight.remove(&claimed.receipt);
        Ok(())
    }

    async fn nack(&self, claimed: &ClaimedTask, retry_after: Duration) -> Result<(), QueueError> {
        self.check_available()?;
        let next = claimed.task.next_attempt().encode()?;
        let mut state = self.state.lock().await;
        if state.inflight.remove(&claimed.receipt).is_some() {
            state.retry.push((Instant::now() + retry_after, next));
        }
        Ok(())
    }

    async fn dead_letter(
        &self,
        claimed: &ClaimedTask,
        record: &FailureRecord,
    ) -> Result<(), QueueError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if state.inflight.remove(&claimed.receipt).is_some() {
            state.dead.push(record.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::tests::sample_task;

    const VISIBILITY: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn fifo_claim_and_ack() {
        let queue = MemoryTaskQueue::new();
        queue.enqueue(&sample_task("Ev1")).await.unwrap();
        queue.enqueue(&sample_task("Ev2")).await.unwrap();

        let first = queue.dequeue(VISIBILITY).await.unwrap().unwrap();
        assert_eq!(first.task.event_identity.as_str(), "Ev1");
        assert_eq!(queue.inflight_len().await, 1);

        queue.ack(&first).await.unwrap();
        assert_eq!(queue.inflight_len().await, 0);

        let second = queue.dequeue(VISIBILITY).await.unwrap().unwrap();
        assert_eq!(second.task.event_identity.as_str(), "Ev2");
        assert!(queue.dequeue(VISIBILITY).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn nack_delays_and_counts_attempt() {
        let queue = MemoryTaskQueue::new();
        queue.enqueue(&sample_task("Ev1")).await.unwrap();

        let claimed = queue.dequeue(VISIBILITY).await.unwrap().unwrap();
        queue.nack(&claimed, Duration::from_secs(5)).await.unwrap();
        assert!(queue.dequeue(VISIBILITY).await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(5)).await;
        let retried = queue.dequeue(VISIBILITY).await.unwrap().unwrap();
        assert_eq!(retried.task.attempt_count, 1);
        assert_eq!(retried.task.task_id, claimed.task.task_id);
    }

    #[tokio::test(start_paused = true)]
    async fn unsettled_claim_becomes_visible_again() {
        let queue = MemoryTaskQueue::new();
        queue.enqueue(&sample_task("Ev1")).await.unwrap();

        let claimed = queue.dequeue(VISIBILITY).await.unwrap().unwrap();
        tokio::time::advance(VISIBILITY).await;

        let reclaimed = queue.dequeue(VISIBILITY).await.unwrap().unwrap();
        assert_eq!(reclaimed.task.task_id, claimed.task.task_id);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_settle_does_not_touch_new_claim() {
        let queue = MemoryTaskQueue::new();
        queue.enqueue(&sample_task("Ev1")).await.unwrap();

        let stale = queue.dequeue(VISIBILITY).await.unwrap().unwrap();
        tokio::time::advance(VISIBILITY).await;
        let live = queue.dequeue(VISIBILITY).await.unwrap().unwrap();
        assert_eq!(live.task.task_id, stale.task.task_id);
        assert_ne!(live.receipt, stale.receipt);

        queue.ack(&stale).await.unwrap();
        assert_eq!(queue.inflight_len().await, 1);
        queue.nack(&stale, Duration::ZERO).await.unwrap();
        assert_eq!(queue.retry_len().await, 0);
        let record = FailureRecord::for_task(&stale.task, 1, "late");
        queue.dead_letter(&stale, &record).await.unwrap();
        assert!(queue.dead_letters().await.is_empty());

        // The live claim still expires and settles normally.
        assert!(queue.dequeue(VISIBILITY).await.unwrap().is_none());
        queue.ack(&live).await.unwrap();
        assert_eq!(queue.inflight_len().await, 0);
        tokio::time::advance(VISIBILITY).await;
        assert!(queue.dequeue(VISIBILITY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dead_letter_parks_record() {
        let queue = MemoryTaskQueue::new();
        queue.enqueue(&sample_task("Ev1")).await.unwrap();

        let claimed = queue.dequeue(VISIBILITY).await.unwrap().unwrap();
        let record = FailureRecord::for_task(&claimed.task, 3, "boom");
        queue.dead_letter(&claimed, &record).await.unwrap();

        assert_eq!(queue.dead_letters().await, vec![record]);
        assert_eq!(queue.inflight_len().await, 0);
        assert!(queue.dequeue(VISIBILITY).await.unwrap().is_none());
    }
}

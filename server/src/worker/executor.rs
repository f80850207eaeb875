//! Worker Executor
//!
//! Pulls tasks off the shared queue, runs the automation for each one and
//! reports back to the platform.
//!
//! - Concurrency is bounded by a semaphore; the loop only claims a task once
//!   a slot is free, so claimed tasks never wait behind the limit.
//! - Failures are retried with exponential backoff and jitter.
//! - After `max_attempts` the task is dead-lettered and the user is told.
//! - An automation that reports an error in its own result is not retried;
//!   its message is posted once like any other reply.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use sy_common::FailureRecord;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bots::{BotConfig, BotRegistry};
use crate::dispatch::{ClaimedTask, TaskQueue};
use crate::observability::metrics;
use crate::worker::attachments::{AttachmentFetcher, FetchError};
use crate::worker::automation::{AutomationError, AutomationRequest, AutomationRunner};
use crate::worker::platform::{
    PlatformClient, PlatformError, Target, REACTION_FAILURE, REACTION_PROCESSING,
    REACTION_SUCCESS,
};

/// Posted when a message carries neither text nor a usable file.
pub const EMPTY_PROMPT_REPLY: &str = "Hey! How can I help you?";

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Tasks executed at once.
    pub concurrency: usize,
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// How long a claimed task stays hidden from other workers.
    pub visibility_timeout: Duration,
    /// Attempts before a task is dead-lettered.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles per attempt.
    pub retry_base: Duration,
    /// Upper bound on the backoff before jitter.
    pub retry_cap: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval: Duration::from_millis(500),
            visibility_timeout: Duration::from_secs(900),
            max_attempts: 3,
            retry_base: Duration::from_secs(5),
            retry_cap: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Automation(#[from] AutomationError),
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error("Failed to stage attachments: {0}")]
    Attachments(#[from] FetchError),
    #[error("No bot configured for source '{0}'")]
    UnknownBot(String),
}

/// How a task was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    /// The automation ran and reported its own failure; the message was posted.
    AutomationError,
    Retrying { attempt: u32, delay: Duration },
    DeadLettered { attempts: u32 },
}

impl TaskOutcome {
    const fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::AutomationError => "automation_error",
            Self::Retrying { .. } => "retried",
            Self::DeadLettered { .. } => "dead_lettered",
        }
    }
}

/// Backoff before retry number `attempt + 1`:
/// `min(base * 2^attempt, cap)` plus up to 10% jitter.
pub fn retry_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    let delay = base.saturating_mul(factor).min(cap);
    let jitter_ms = (delay.as_millis() / 10) as u64;
    let jitter = if jitter_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_ms)
    };
    delay + Duration::from_millis(jitter)
}

pub struct WorkerPool {
    queue: Arc<dyn TaskQueue>,
    bots: BotRegistry,
    runner: Arc<dyn AutomationRunner>,
    platform: Arc<dyn PlatformClient>,
    fetcher: AttachmentFetcher,
    config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        bots: BotRegistry,
        runner: Arc<dyn AutomationRunner>,
        platform: Arc<dyn PlatformClient>,
        fetcher: AttachmentFetcher,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            bots,
            runner,
            platform,
            fetcher,
            config,
        }
    }

    /// Start the consumer loop. It stops claiming work once `shutdown` is
    /// cancelled and returns after in-flight tasks finish.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(Arc::new(self).run(shutdown))
    }

    async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let concurrency = self.config.concurrency.max(1);
        let slots = Arc::new(Semaphore::new(concurrency));
        let mut consecutive_errors: u32 = 0;

        info!(concurrency, "Worker pool started");

        loop {
            let permit = tokio::select! {
                () = shutdown.cancelled() => break,
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let claimed = match self.queue.dequeue(self.config.visibility_timeout).await {
                Ok(Some(claimed)) => {
                    consecutive_errors = 0;
                    claimed
                }
                Ok(None) => {
                    consecutive_errors = 0;
                    drop(permit);
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(self.config.poll_interval) => continue,
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    let backoff_secs = 1u64 << consecutive_errors.min(5); // 2, 4, ... 32
                    error!(consecutive_errors, backoff_secs, error = %e, "Failed to dequeue task");
                    drop(permit);
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(Duration::from_secs(backoff_secs)) => continue,
                    }
                }
            };

            let pool = Arc::clone(&self);
            tokio::spawn(async move {
                let task_id = claimed.task.task_id;
                let event_identity = claimed.task.event_identity.clone();
                let handle = tokio::spawn(async move { pool.process(claimed).await });
                if let Err(e) = handle.await {
                    error!(
                        task_id = %task_id,
                        event_identity = %event_identity,
                        "Task panicked: {}", e
                    );
                }
                drop(permit);
            });
        }

        // Wait for in-flight tasks.
        let _ = slots.acquire_many(concurrency as u32).await;
        info!("Worker pool stopped");
    }

    /// Run one claimed task to a settled state.
    #[tracing::instrument(
        skip(self, claimed),
        fields(
            task_id = %claimed.task.task_id,
            event_identity = %claimed.task.event_identity,
            source_id = %claimed.task.source_id,
            attempt = claimed.task.attempt_count
        )
    )]
    pub async fn process(&self, claimed: ClaimedTask) -> TaskOutcome {
        let started = Instant::now();

        let outcome = match self.bots.get(&claimed.task.source_id) {
            Some(bot) => self.execute(&claimed, &bot).await,
            None => {
                let err = WorkerError::UnknownBot(claimed.task.source_id.clone());
                self.dead_letter(&claimed, None, &err).await
            }
        };

        metrics::record_task(outcome.label());
        metrics::record_task_duration(started.elapsed().as_secs_f64());
        outcome
    }

    async fn execute(&self, claimed: &ClaimedTask, bot: &BotConfig) -> TaskOutcome {
        let task = &claimed.task;
        let target = Target {
            token: &bot.bot_token,
            channel: &task.payload.channel,
        };

        if task.attempt_count == 0 {
            self.react(target, &task.payload.ts, REACTION_PROCESSING, true).await;
        }

        let staged = match self.fetcher.stage(&bot.bot_token, &task.payload.files).await {
            Ok(staged) => staged,
            Err(e) => return self.fail(claimed, Some(bot), WorkerError::Attachments(e)).await,
        };
        if task.attempt_count == 0 {
            for (name, err) in &staged.failures {
                let notice = format!("Failed to download `{name}`: {err}");
                self.post(target, task.payload.reply_ts(), &notice).await;
            }
        }

        if task.payload.text.trim().is_empty() && staged.files.is_empty() {
            self.post(target, task.payload.reply_ts(), EMPTY_PROMPT_REPLY).await;
            self.react(target, &task.payload.ts, REACTION_PROCESSING, false).await;
            return self.complete(claimed, TaskOutcome::Completed).await;
        }

        let request = AutomationRequest {
            working_directory: bot.working_directory.clone(),
            channel: task.payload.channel.clone(),
            session_id: task.payload.session_id,
            text: task.payload.text.clone(),
            files: staged.files.clone(),
            files_dir: staged.dir().map(Path::to_path_buf),
        };

        let result = self.runner.run(&request).await;
        drop(staged);
        let output = match result {
            Ok(output) => output,
            Err(e) => return self.fail(claimed, Some(bot), WorkerError::Automation(e)).await,
        };

        let mut reply = output.reply;
        let summary = output.stats.summary_line();
        if reply.trim().is_empty() {
            reply = "_(no output)_".to_string();
        }
        reply.push_str(&format!("\n\n_{summary}_"));

        // The automation already ran; a failed post must not run it again.
        self.post(target, task.payload.reply_ts(), &reply).await;
        self.react(target, &task.payload.ts, REACTION_PROCESSING, false).await;

        let outcome = if output.is_error {
            warn!(bot = %bot.name, "Automation reported an error; posted without retry");
            self.react(target, &task.payload.ts, REACTION_FAILURE, true).await;
            TaskOutcome::AutomationError
        } else {
            self.react(target, &task.payload.ts, REACTION_SUCCESS, true).await;
            info!(bot = %bot.name, duration_ms = output.stats.duration_ms, "Task completed");
            TaskOutcome::Completed
        };
        self.complete(claimed, outcome).await
    }

    async fn complete(&self, claimed: &ClaimedTask, outcome: TaskOutcome) -> TaskOutcome {
        if let Err(e) = self.queue.ack(claimed).await {
            error!(error = %e, "Failed to ack task; it will be redelivered");
        }
        outcome
    }

    async fn fail(
        &self,
        claimed: &ClaimedTask,
        bot: Option<&BotConfig>,
        err: WorkerError,
    ) -> TaskOutcome {
        let attempts = claimed.task.attempt_count + 1;
        if attempts >= self.config.max_attempts {
            return self.dead_letter(claimed, bot, &err).await;
        }

        let delay = retry_delay(
            claimed.task.attempt_count,
            self.config.retry_base,
            self.config.retry_cap,
        );
        warn!(attempts, delay_ms = delay.as_millis() as u64, error = %err, "Task failed, retrying");
        if let Err(e) = self.queue.nack(claimed, delay).await {
            error!(error = %e, "Failed to schedule retry; claim will expire");
        }
        TaskOutcome::Retrying {
            attempt: attempts,
            delay,
        }
    }

    async fn dead_letter(
        &self,
        claimed: &ClaimedTask,
        bot: Option<&BotConfig>,
        err: &WorkerError,
    ) -> TaskOutcome {
        let task = &claimed.task;
        let attempts = task.attempt_count + 1;
        let record = FailureRecord::for_task(task, attempts, err.to_string());

        error!(attempts, error = %err, "Task exhausted, dead-lettering");
        if let Err(e) = self.queue.dead_letter(claimed, &record).await {
            error!(error = %e, "Failed to dead-letter task; claim will expire");
        }

        if let Some(bot) = bot {
            let target = Target {
                token: &bot.bot_token,
                channel: &task.payload.channel,
            };
            let message = format!(
                ":x: Sorry, I couldn't complete this request after {attempts} attempt{}.",
                if attempts == 1 { "" } else { "s" }
            );
            self.post(target, task.payload.reply_ts(), &message).await;
            self.react(target, &task.payload.ts, REACTION_PROCESSING, false).await;
            self.react(target, &task.payload.ts, REACTION_FAILURE, true).await;
        }

        TaskOutcome::DeadLettered { attempts }
    }

    /// Best-effort thread reply.
    async fn post(&self, target: Target<'_>, thread_ts: &str, text: &str) {
        if let Err(e) = self.platform.post_message(target, thread_ts, text).await {
            warn!(error = %e, "Failed to post message");
        }
    }

    /// Best-effort reaction update.
    async fn react(&self, target: Target<'_>, ts: &str, name: &str, add: bool) {
        let result = if add {
            self.platform.add_reaction(target, ts, name).await
        } else {
            self.platform.remove_reaction(target, ts, name).await
        };
        if let Err(e) = result {
            warn!(reaction = name, error = %e, "Failed to update reaction");
        }
    }
}

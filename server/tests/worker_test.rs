//! Worker Pool Tests
//!
//! Run the executor against the in-memory queue with a scripted automation
//! runner and a recording platform client.

mod helpers;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sy_common::{Attachment, AttachmentKind, DispatchTask, EventIdentity, TaskPayload};
use sy_server::bots::BotRegistry;
use sy_server::dispatch::{MemoryTaskQueue, TaskQueue};
use sy_server::worker::{
    AttachmentFetcher, AutomationError, AutomationOutput, AutomationRequest, AutomationRunner,
    AutomationStats, PlatformClient, PlatformError, Target, TaskOutcome, WorkerConfig, WorkerPool,
    EMPTY_PROMPT_REPLY,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use helpers::{test_bots, CHANNEL, SOURCE_ID};

/// One scripted automation run.
#[derive(Debug, Clone, Copy)]
enum Step {
    /// Clean result with this reply.
    Reply(&'static str),
    /// Result line flagged `is_error` with this message.
    ErrorResult(&'static str),
    /// Process failure with this stderr.
    Fail(&'static str),
}

/// Runner that replays scripted results and records every request.
#[derive(Default)]
struct ScriptedRunner {
    steps: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<AutomationRequest>>,
    /// Whether every staged file was readable when the run started.
    files_readable: Mutex<Vec<bool>>,
}

impl ScriptedRunner {
    fn new(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into_iter().collect()),
            ..Self::default()
        })
    }
}

fn output(reply: &str, is_error: bool) -> AutomationOutput {
    AutomationOutput {
        reply: reply.to_string(),
        session_id: None,
        stats: AutomationStats::default(),
        is_error,
    }
}

#[async_trait]
impl AutomationRunner for ScriptedRunner {
    async fn run(&self, request: &AutomationRequest) -> Result<AutomationOutput, AutomationError> {
        self.requests.lock().await.push(request.clone());
        let readable = request.files.iter().all(|f| std::fs::read(&f.path).is_ok());
        self.files_readable.lock().await.push(readable);

        let failure = |stderr: &str| AutomationError::Exit {
            code: Some(1),
            stderr: stderr.to_string(),
        };
        match self.steps.lock().await.pop_front() {
            Some(Step::Reply(reply)) => Ok(output(reply, false)),
            Some(Step::ErrorResult(message)) => Ok(output(message, true)),
            Some(Step::Fail(stderr)) => Err(failure(stderr)),
            None => Err(failure("no scripted result")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PlatformCall {
    Post { channel: String, thread_ts: String, text: String },
    React { name: String, add: bool },
}

#[derive(Default)]
struct RecordingPlatform {
    calls: Mutex<Vec<PlatformCall>>,
}

impl RecordingPlatform {
    async fn posts(&self) -> Vec<(String, String, String)> {
        self.calls
            .lock()
            .await
            .iter()
            .filter_map(|call| match call {
                PlatformCall::Post {
                    channel,
                    thread_ts,
                    text,
                } => Some((channel.clone(), thread_ts.clone(), text.clone())),
                PlatformCall::React { .. } => None,
            })
            .collect()
    }

    async fn reactions_added(&self) -> Vec<String> {
        self.calls
            .lock()
            .await
            .iter()
            .filter_map(|call| match call {
                PlatformCall::React { name, add: true } => Some(name.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl PlatformClient for RecordingPlatform {
    async fn post_message(
        &self,
        target: Target<'_>,
        thread_ts: &str,
        text: &str,
    ) -> Result<Option<String>, PlatformError> {
        self.calls.lock().await.push(PlatformCall::Post {
            channel: target.channel.to_string(),
            thread_ts: thread_ts.to_string(),
            text: text.to_string(),
        });
        Ok(Some("2.0".into()))
    }

    async fn add_reaction(
        &self,
        _target: Target<'_>,
        _ts: &str,
        name: &str,
    ) -> Result<(), PlatformError> {
        self.calls.lock().await.push(PlatformCall::React {
            name: name.to_string(),
            add: true,
        });
        Ok(())
    }

    async fn remove_reaction(
        &self,
        _target: Target<'_>,
        _ts: &str,
        name: &str,
    ) -> Result<(), PlatformError> {
        self.calls.lock().await.push(PlatformCall::React {
            name: name.to_string(),
            add: false,
        });
        Ok(())
    }
}

fn task(event_id: &str, source_id: &str) -> DispatchTask {
    DispatchTask::new(
        EventIdentity::new(event_id).unwrap(),
        source_id,
        TaskPayload {
            channel: CHANNEL.into(),
            user: "U1".into(),
            text: "summarise the logs".into(),
            ts: "1700000000.000100".into(),
            thread_ts: None,
            files: vec![],
            session_id: Uuid::nil(),
        },
    )
}

fn config() -> WorkerConfig {
    WorkerConfig {
        concurrency: 2,
        poll_interval: Duration::from_millis(10),
        visibility_timeout: Duration::from_secs(30),
        max_attempts: 3,
        retry_base: Duration::from_millis(10),
        retry_cap: Duration::from_millis(50),
    }
}

struct Harness {
    queue: Arc<MemoryTaskQueue>,
    runner: Arc<ScriptedRunner>,
    platform: Arc<RecordingPlatform>,
    pool: WorkerPool,
}

fn harness(runner: Arc<ScriptedRunner>, bots: BotRegistry) -> Harness {
    let queue = Arc::new(MemoryTaskQueue::new());
    let platform = Arc::new(RecordingPlatform::default());
    let fetcher = AttachmentFetcher::new(reqwest::Client::builder().no_proxy().build().unwrap());
    let pool = WorkerPool::new(
        queue.clone(),
        bots,
        runner.clone(),
        platform.clone(),
        fetcher,
        config(),
    );
    Harness {
        queue,
        runner,
        platform,
        pool,
    }
}

/// Serve `response` to every connection on a local port; returns the base URL.
async fn serve_files(response: &'static [u8]) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => head.extend_from_slice(&buf[..n]),
                }
            }
            let _ = socket.write_all(response).await;
            let _ = socket.shutdown().await;
        }
    });
    format!("http://{addr}")
}

fn pdf(url: String) -> Attachment {
    Attachment {
        id: "F1".into(),
        name: "runbook.pdf".into(),
        kind: AttachmentKind::Pdf,
        mimetype: "application/pdf".into(),
        url,
        size: 16,
    }
}

/// Claim the next task, waiting out any retry delay.
async fn claim(queue: &MemoryTaskQueue) -> sy_server::dispatch::ClaimedTask {
    for _ in 0..100 {
        if let Some(claimed) = queue.dequeue(Duration::from_secs(30)).await.unwrap() {
            return claimed;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no task became ready");
}

#[tokio::test]
async fn test_runs_in_bot_working_directory_and_replies_in_thread() {
    let h = harness(ScriptedRunner::new([Step::Reply("All clear.")]), test_bots());
    h.queue.enqueue(&task("Ev1", SOURCE_ID)).await.unwrap();

    let outcome = h.pool.process(claim(&h.queue).await).await;
    assert_eq!(outcome, TaskOutcome::Completed);

    let requests = h.runner.requests.lock().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].working_directory.to_str(), Some("/srv/ops"));
    assert_eq!(requests[0].channel, CHANNEL);
    assert_eq!(requests[0].text, "summarise the logs");

    let posts = h.platform.posts().await;
    assert_eq!(posts.len(), 1);
    let (channel, thread_ts, text) = &posts[0];
    assert_eq!(channel, CHANNEL);
    assert_eq!(thread_ts, "1700000000.000100");
    assert!(text.starts_with("All clear."));

    assert_eq!(
        h.platform.reactions_added().await,
        ["hourglass_flowing_sand", "white_check_mark"]
    );
    assert_eq!(h.queue.inflight_len().await, 0);
    assert_eq!(h.queue.ready_len().await, 0);
}

#[tokio::test]
async fn test_failure_is_retried_then_succeeds() {
    let h = harness(ScriptedRunner::new([Step::Fail("flaky"), Step::Reply("done")]), test_bots());
    h.queue.enqueue(&task("Ev1", SOURCE_ID)).await.unwrap();

    let first = h.pool.process(claim(&h.queue).await).await;
    assert!(matches!(first, TaskOutcome::Retrying { attempt: 1, .. }));
    assert_eq!(h.queue.retry_len().await, 1);

    let retried = claim(&h.queue).await;
    assert_eq!(retried.task.attempt_count, 1);
    assert_eq!(h.pool.process(retried).await, TaskOutcome::Completed);

    assert_eq!(h.platform.posts().await.len(), 1);
    assert!(h.queue.dead_letters().await.is_empty());
}

#[tokio::test]
async fn test_exhausted_task_is_dead_lettered_and_reported() {
    let h = harness(
        ScriptedRunner::new([Step::Fail("boom"), Step::Fail("boom"), Step::Fail("boom")]),
        test_bots(),
    );
    h.queue.enqueue(&task("Ev1", SOURCE_ID)).await.unwrap();

    let mut outcomes = Vec::new();
    for _ in 0..3 {
        outcomes.push(h.pool.process(claim(&h.queue).await).await);
    }

    assert_eq!(outcomes[2], TaskOutcome::DeadLettered { attempts: 3 });
    assert_eq!(h.runner.requests.lock().await.len(), 3);

    let dead = h.queue.dead_letters().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 3);

    let posts = h.platform.posts().await;
    assert_eq!(posts.len(), 1);
    assert!(posts[0].2.contains("after 3 attempts"));
    assert!(h.platform.reactions_added().await.contains(&"x".to_string()));
}

#[tokio::test]
async fn test_unknown_bot_is_dead_lettered_without_running() {
    let h = harness(ScriptedRunner::new([Step::Reply("never")]), test_bots());
    h.queue.enqueue(&task("Ev1", "A0GONE")).await.unwrap();

    let outcome = h.pool.process(claim(&h.queue).await).await;

    assert_eq!(outcome, TaskOutcome::DeadLettered { attempts: 1 });
    assert!(h.runner.requests.lock().await.is_empty());
    assert!(h.platform.posts().await.is_empty());
    assert_eq!(h.queue.dead_letters().await.len(), 1);
}

#[tokio::test]
async fn test_pool_drains_queue_and_stops_on_cancel() {
    let runner = ScriptedRunner::new([Step::Reply("one"), Step::Reply("two"), Step::Reply("three")]);
    let h = harness(runner, test_bots());
    for i in 0..3 {
        h.queue.enqueue(&task(&format!("Ev{i}"), SOURCE_ID)).await.unwrap();
    }

    let shutdown = CancellationToken::new();
    let queue = h.queue.clone();
    let platform = h.platform.clone();
    let handle = h.pool.spawn(shutdown.clone());

    for _ in 0..200 {
        if platform.posts().await.len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(platform.posts().await.len(), 3);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker pool stops after cancel")
        .unwrap();
    assert_eq!(queue.ready_len().await, 0);
    assert_eq!(queue.inflight_len().await, 0);
}

#[tokio::test]
async fn test_error_result_is_posted_once_without_retry() {
    let h = harness(
        ScriptedRunner::new([Step::ErrorResult("Credit balance is too low")]),
        test_bots(),
    );
    h.queue.enqueue(&task("Ev1", SOURCE_ID)).await.unwrap();

    let outcome = h.pool.process(claim(&h.queue).await).await;

    assert_eq!(outcome, TaskOutcome::AutomationError);
    assert_eq!(h.runner.requests.lock().await.len(), 1);
    let posts = h.platform.posts().await;
    assert_eq!(posts.len(), 1);
    assert!(posts[0].2.starts_with("Credit balance is too low"));
    assert!(h.platform.reactions_added().await.contains(&"x".to_string()));

    assert_eq!(h.queue.retry_len().await, 0);
    assert_eq!(h.queue.inflight_len().await, 0);
    assert!(h.queue.dead_letters().await.is_empty());
}

#[tokio::test]
async fn test_attachments_are_staged_for_the_run_and_removed_after() {
    let base = serve_files(
        b"HTTP/1.1 200 OK\r\nContent-Length: 16\r\nConnection: close\r\n\r\n%PDF-1.4 runbook",
    )
    .await;
    let h = harness(ScriptedRunner::new([Step::Reply("read it")]), test_bots());
    let mut with_file = task("Ev1", SOURCE_ID);
    with_file.payload.files = vec![pdf(format!("{base}/files/F1"))];
    h.queue.enqueue(&with_file).await.unwrap();

    assert_eq!(h.pool.process(claim(&h.queue).await).await, TaskOutcome::Completed);

    let requests = h.runner.requests.lock().await;
    let dir = requests[0].files_dir.clone().expect("files dir passed");
    assert_eq!(requests[0].files.len(), 1);
    assert!(requests[0].prompt().contains("User's message: summarise the logs"));
    assert_eq!(*h.runner.files_readable.lock().await, [true]);
    assert!(!dir.exists(), "staging directory removed after the run");
}

#[tokio::test]
async fn test_failed_download_is_reported_and_empty_prompt_greeted() {
    let base = serve_files(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").await;
    let h = harness(ScriptedRunner::new([Step::Reply("never")]), test_bots());
    let mut file_only = task("Ev1", SOURCE_ID);
    file_only.payload.text = String::new();
    file_only.payload.files = vec![pdf(format!("{base}/files/F1"))];
    h.queue.enqueue(&file_only).await.unwrap();

    assert_eq!(h.pool.process(claim(&h.queue).await).await, TaskOutcome::Completed);

    assert!(h.runner.requests.lock().await.is_empty());
    let posts: Vec<String> = h.platform.posts().await.into_iter().map(|p| p.2).collect();
    assert_eq!(
        posts,
        ["Failed to download `runbook.pdf`: HTTP 404", EMPTY_PROMPT_REPLY]
    );
    assert_eq!(h.queue.inflight_len().await, 0);
}

//! Automation Runner
//!
//! Runs the configured command-line automation for a task and parses its
//! newline-delimited JSON output into a reply plus run statistics.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::worker::attachments::StagedFile;

/// Environment variable carrying the originating channel.
pub const CHANNEL_ENV: &str = "SWITCHYARD_CHANNEL";

/// Environment variable carrying the conversation session id.
pub const SESSION_ENV: &str = "SWITCHYARD_SESSION_ID";

/// Cap on captured stderr kept for error reports.
const MAX_STDERR_BYTES: usize = 4 * 1024;

/// Marker the automation prints when the session id is held by an earlier run.
const SESSION_IN_USE: &str = "already in use";

/// Everything the automation needs for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutomationRequest {
    pub working_directory: PathBuf,
    pub channel: String,
    pub session_id: Uuid,
    pub text: String,
    /// Attachments already downloaded to local disk.
    pub files: Vec<StagedFile>,
    /// Directory holding `files`; granted to the automation with `--add-dir`.
    pub files_dir: Option<PathBuf>,
}

impl AutomationRequest {
    /// Prompt passed to the automation. With files attached, the local paths
    /// come first and the user's text follows.
    pub fn prompt(&self) -> String {
        if self.files.is_empty() {
            return self.text.clone();
        }
        let listing = self
            .files
            .iter()
            .map(|file| format!("- {}: {}", file.kind.label(), file.path.display()))
            .collect::<Vec<_>>()
            .join("\n");

        if self.text.trim().is_empty() {
            format!(
                "The user has attached the following file(s). Please read and analyze them:\n\n{listing}"
            )
        } else {
            format!(
                "The user has attached the following file(s). Please read and analyze them as part of your response:\n\n{listing}\n\nUser's message: {}",
                self.text
            )
        }
    }
}

/// Statistics reported in the final `result` line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AutomationStats {
    pub duration_ms: u64,
    pub num_turns: u32,
    pub total_cost_usd: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub files_read: u32,
    pub files_edited: u32,
    pub files_written: u32,
    pub commands_run: u32,
    pub searches: u32,
}

impl AutomationStats {
    /// One-line summary such as `12.3s | $0.0123 | 1,234 tokens`.
    pub fn summary_line(&self) -> String {
        let mut parts = vec![format!("{:.1}s", self.duration_ms as f64 / 1000.0)];
        if self.total_cost_usd > 0.0 {
            parts.push(format!("${:.4}", self.total_cost_usd));
        }
        let tokens = self.input_tokens + self.output_tokens;
        if tokens > 0 {
            parts.push(format!("{} tokens", group_thousands(tokens)));
        }
        parts.join(" | ")
    }
}

fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Parsed result of a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AutomationOutput {
    /// Text to post back; the final result, or the last assistant text.
    pub reply: String,
    pub session_id: Option<String>,
    pub stats: AutomationStats,
    /// The automation reported failure in its result line. The reply then
    /// holds its own error message.
    pub is_error: bool,
}

#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("Failed to start automation: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Automation I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Automation exited with status {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },

    #[error("Automation timed out after {0:?}")]
    Timeout(Duration),
}

/// Executes the automation for a request.
#[async_trait]
pub trait AutomationRunner: Send + Sync {
    async fn run(&self, request: &AutomationRequest) -> Result<AutomationOutput, AutomationError>;
}

/// How the session id is handed to the automation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionMode {
    Start,
    Resume,
}

impl SessionMode {
    const fn flag(self) -> &'static str {
        match self {
            Self::Start => "--session-id",
            Self::Resume => "--resume",
        }
    }
}

/// Exit status and captured output of one process run.
struct RawRun {
    status: ExitStatus,
    stdout: String,
    stderr: Vec<u8>,
}

impl RawRun {
    /// The first line of either stream says the session is held elsewhere.
    fn session_in_use(&self) -> bool {
        let first_line_matches = |text: &str| {
            text.lines()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .is_some_and(|line| line.contains(SESSION_IN_USE))
        };
        first_line_matches(self.stdout.as_str())
            || first_line_matches(String::from_utf8_lossy(&self.stderr).as_ref())
    }
}

/// Runs an external program in the bot's working directory.
///
/// Invocation: `{program} {args..} --session-id {session} -p {prompt}
/// [--add-dir {files_dir}]` with [`CHANNEL_ENV`] and [`SESSION_ENV`] set.
/// If the session id is already in use, the run is repeated once with
/// `--resume {session}` in place of `--session-id`. Both runs share one
/// timeout.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandRunner {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    fn command(&self, request: &AutomationRequest, mode: SessionMode) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(mode.flag())
            .arg(request.session_id.to_string())
            .arg("-p")
            .arg(request.prompt());
        if let Some(dir) = &request.files_dir {
            command.arg("--add-dir").arg(dir);
        }
        command
            .current_dir(&request.working_directory)
            .env(CHANNEL_ENV, &request.channel)
            .env(SESSION_ENV, request.session_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    async fn execute(
        &self,
        request: &AutomationRequest,
        mode: SessionMode,
        deadline: Instant,
    ) -> Result<RawRun, AutomationError> {
        let mut child = self
            .command(request, mode)
            .spawn()
            .map_err(AutomationError::Spawn)?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stdout_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut reader) = stdout {
                reader.read_to_string(&mut buf).await?;
            }
            Ok::<String, std::io::Error>(buf)
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut reader) = stderr {
                reader.read_to_end(&mut buf).await?;
            }
            Ok::<Vec<u8>, std::io::Error>(buf)
        });

        let status = match tokio::time::timeout_at(deadline, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill timed out automation");
                }
                stdout_task.abort();
                stderr_task.abort();
                return Err(AutomationError::Timeout(self.timeout));
            }
        };

        Ok(RawRun {
            status,
            stdout: join_output(stdout_task.await)?,
            stderr: join_output(stderr_task.await)?,
        })
    }
}

#[async_trait]
impl AutomationRunner for CommandRunner {
    #[tracing::instrument(skip(self, request), fields(channel = %request.channel, session_id = %request.session_id))]
    async fn run(&self, request: &AutomationRequest) -> Result<AutomationOutput, AutomationError> {
        let deadline = Instant::now() + self.timeout;

        let mut run = self.execute(request, SessionMode::Start, deadline).await?;
        if run.session_in_use() {
            info!("Session already in use, resuming it");
            run = self.execute(request, SessionMode::Resume, deadline).await?;
        }

        if !run.status.success() {
            let tail = &run.stderr[run.stderr.len().saturating_sub(MAX_STDERR_BYTES)..];
            return Err(AutomationError::Exit {
                code: run.status.code(),
                stderr: String::from_utf8_lossy(tail).trim().to_string(),
            });
        }

        let output = parse_stream(&run.stdout);
        debug!(
            duration_ms = output.stats.duration_ms,
            turns = output.stats.num_turns,
            is_error = output.is_error,
            "Automation finished"
        );
        Ok(output)
    }
}

fn join_output<T>(
    joined: Result<std::io::Result<T>, tokio::task::JoinError>,
) -> Result<T, AutomationError> {
    joined
        .map_err(|e| AutomationError::Io(std::io::Error::other(e)))?
        .map_err(AutomationError::Io)
}

// ============================================================================
// Stream parsing
// ============================================================================

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum StreamLine {
    System {
        #[serde(default)]
        session_id: Option<String>,
    },
    Assistant {
        #[serde(default)]
        message: StreamMessage,
        #[serde(default)]
        session_id: Option<String>,
    },
    Result {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        result: String,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        duration_ms: u64,
        #[serde(default)]
        num_turns: u32,
        #[serde(default)]
        total_cost_usd: f64,
        #[serde(default)]
        usage: Usage,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Default)]
struct StreamMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        #[serde(default)]
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Default)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Parse the automation's JSON-lines output. Unparseable lines are skipped.
pub fn parse_stream(raw: &str) -> AutomationOutput {
    let mut output = AutomationOutput::default();
    let mut last_text = String::new();
    let mut result_text = None;

    for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let parsed: StreamLine = match serde_json::from_str(line) {
            Ok(parsed) => parsed,
            Err(e) => {
                let preview: String = line.chars().take(100).collect();
                warn!(error = %e, line = %preview, "Skipping unparseable automation output");
                continue;
            }
        };

        match parsed {
            StreamLine::System { session_id } => {
                if session_id.is_some() {
                    output.session_id = session_id;
                }
            }
            StreamLine::Assistant {
                message,
                session_id,
            } => {
                if session_id.is_some() {
                    output.session_id = session_id;
                }
                let mut text = String::new();
                for block in message.content {
                    match block {
                        ContentBlock::Text { text: part } => text.push_str(&part),
                        ContentBlock::ToolUse { name } => track_tool(&mut output.stats, &name),
                        ContentBlock::Other => {}
                    }
                }
                if !text.is_empty() {
                    last_text = text;
                }
            }
            StreamLine::Result {
                subtype,
                is_error,
                result,
                session_id,
                duration_ms,
                num_turns,
                total_cost_usd,
                usage,
            } => {
                if session_id.is_some() {
                    output.session_id = session_id;
                }
                output.is_error = is_error || subtype.as_deref() == Some("error");
                output.stats.duration_ms = duration_ms;
                output.stats.num_turns = num_turns;
                output.stats.total_cost_usd = total_cost_usd;
                output.stats.input_tokens = usage.input_tokens;
                output.stats.output_tokens = usage.output_tokens;
                result_text = Some(result);
            }
            StreamLine::Other => {}
        }
    }

    output.reply = match result_text {
        Some(text) if !text.trim().is_empty() => text,
        _ => last_text,
    };
    output
}

fn track_tool(stats: &mut AutomationStats, name: &str) {
    match name {
        "Read" => stats.files_read += 1,
        "Edit" => stats.files_edited += 1,
        "Write" => stats.files_written += 1,
        "Bash" => stats.commands_run += 1,
        "Glob" | "Grep" => stats.searches += 1,
        _ => {}
    }
}

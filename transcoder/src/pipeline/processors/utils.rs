//! Supervised execution of external tools.

use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use process_utils::{ProcessRegistry, Registration};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, trace, warn};

use super::traits::ToolContext;

/// Lines of stderr kept for error messages.
const STDERR_TAIL_LINES: usize = 20;

/// How long to wait for the stderr reader after the process exited.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Why a tool run did not produce an exit status.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for process: {0}")]
    Wait(#[source] std::io::Error),

    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("killed during shutdown")]
    Cancelled,

    #[error("a process is already running under {0}")]
    AlreadyRunning(String),
}

impl ToolError {
    /// Convert into the crate error, wrapping tool failures with `wrap`.
    pub fn into_error(self, task: &str, wrap: impl FnOnce(String) -> crate::Error) -> crate::Error {
        match self {
            Self::Timeout(after) => crate::Error::timeout(task, after),
            Self::Cancelled => crate::Error::Cancelled(format!("{task} interrupted by shutdown")),
            other => wrap(other.to_string()),
        }
    }
}

/// Result of a tool that ran to completion.
#[derive(Debug)]
pub struct ToolOutput {
    pub status: ExitStatus,
    /// Full stdout, only when captured.
    pub stdout: String,
    /// Last lines of stderr.
    pub stderr_tail: Vec<String>,
    pub duration: Duration,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// `exit code N: <last stderr lines>`
    pub fn failure_message(&self) -> String {
        let code = self
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let tail: Vec<&str> = self
            .stderr_tail
            .iter()
            .rev()
            .take(3)
            .rev()
            .map(String::as_str)
            .collect();
        if tail.is_empty() {
            format!("exit code {code}")
        } else {
            format!("exit code {code}: {}", tail.join(" | "))
        }
    }
}

/// Run a tool and capture its whole stdout.
pub async fn run_tool_capture(
    ctx: &ToolContext,
    task: &str,
    command: Command,
) -> Result<ToolOutput, ToolError> {
    run_tool(ctx, task, command, true, |_| {}).await
}

/// Run a tool, handing every stdout line to `on_line` as it arrives.
pub async fn run_tool_streaming<F>(
    ctx: &ToolContext,
    task: &str,
    command: Command,
    on_line: F,
) -> Result<ToolOutput, ToolError>
where
    F: FnMut(&str) + Send,
{
    run_tool(ctx, task, command, false, on_line).await
}

/// Removes a registration when the run future is dropped early.
struct RegistrationGuard<'a> {
    registry: &'a ProcessRegistry<String>,
    registration: Registration<String>,
}

impl Drop for RegistrationGuard<'_> {
    fn drop(&mut self) {
        self.registry.deregister(&self.registration);
    }
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    Killed,
    TimedOut,
}

async fn run_tool<F>(
    ctx: &ToolContext,
    task: &str,
    mut command: Command,
    capture: bool,
    mut on_line: F,
) -> Result<ToolOutput, ToolError>
where
    F: FnMut(&str) + Send,
{
    if ctx.shutdown.is_cancelled() {
        return Err(ToolError::Cancelled);
    }

    let _permit = tokio::select! {
        permit = ctx.permits.clone().acquire_owned() => permit.map_err(|_| ToolError::Cancelled)?,
        _ = ctx.shutdown.cancelled() => return Err(ToolError::Cancelled),
    };
    if ctx.shutdown.is_cancelled() {
        return Err(ToolError::Cancelled);
    }

    let program = command.as_std().get_program().to_string_lossy().into_owned();
    command.stdout(Stdio::piped()).stderr(Stdio::piped());

    let start = Instant::now();
    let mut child = command.spawn().map_err(|source| ToolError::Spawn {
        program: program.clone(),
        source,
    })?;

    let key = ctx.process_key(task);
    let kill_switch = ctx.shutdown.child_token();
    let registration = match ctx.registry.register(key.clone(), kill_switch.clone()) {
        Ok(registration) => registration,
        Err(_) => {
            let _ = child.kill().await;
            return Err(ToolError::AlreadyRunning(key));
        }
    };
    let guard = RegistrationGuard {
        registry: &ctx.registry,
        registration,
    };
    debug!(job_id = %ctx.job_id, task, program = %program, pid = ?child.id(), "Spawned tool");

    let stderr_task = child.stderr.take().map(|stderr| tokio::spawn(collect_tail(stderr)));
    let stdout = child.stdout.take();
    let mut captured = String::new();

    let outcome = tokio::select! {
        status = async {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    trace!(task, "stdout: {}", line);
                    on_line(&line);
                    if capture {
                        captured.push_str(&line);
                        captured.push('\n');
                    }
                }
            }
            child.wait().await
        } => Outcome::Exited(status),
        _ = kill_switch.cancelled() => Outcome::Killed,
        _ = tokio::time::sleep(ctx.timeout) => Outcome::TimedOut,
    };

    let result = match outcome {
        Outcome::Exited(Ok(status)) => {
            ctx.registry.deregister(&guard.registration);
            let stderr_tail = match stderr_task {
                Some(handle) => tokio::time::timeout(STDERR_DRAIN_TIMEOUT, handle)
                    .await
                    .ok()
                    .and_then(Result::ok)
                    .unwrap_or_default(),
                None => Vec::new(),
            };
            Ok(ToolOutput {
                status,
                stdout: captured,
                stderr_tail,
                duration: start.elapsed(),
            })
        }
        Outcome::Exited(Err(e)) => {
            ctx.registry.deregister(&guard.registration);
            Err(ToolError::Wait(e))
        }
        Outcome::Killed => {
            if let Err(e) = child.kill().await {
                warn!(job_id = %ctx.job_id, task, error = %e, "Failed to kill tool process");
            }
            Err(ToolError::Cancelled)
        }
        Outcome::TimedOut => {
            warn!(
                job_id = %ctx.job_id,
                task,
                timeout_secs = ctx.timeout.as_secs(),
                "Tool exceeded its time limit, killing"
            );
            // A concurrent kill_all may already have taken the entry.
            let _ = ctx.registry.kill(&guard.registration);
            if let Err(e) = child.kill().await {
                warn!(job_id = %ctx.job_id, task, error = %e, "Failed to kill tool process");
            }
            Err(ToolError::Timeout(ctx.timeout))
        }
    };

    drop(guard);
    result
}

async fn collect_tail<R>(reader: R) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        trace!("stderr: {}", line);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into()
}

//! External engine invocation
//!
//! Runs the configured engine command once per job: the payload goes in on
//! stdin as JSON, the result comes back on stdout. Cancellation kills the
//! child process; the engine is expected to make its own side effects safe
//! to interrupt.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

use quarry_core::domain::job::Job;

use crate::handler::{ExecutionContext, ExecutionError, JobHandler};

/// Subprocess-backed job handler
pub struct CommandHandler {
    program: String,
    args: Vec<String>,
}

impl CommandHandler {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Builds a handler from a whitespace-split command line.
    pub fn from_command_line(parts: &[String]) -> anyhow::Result<Self> {
        let (program, args) = parts
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("engine command line is empty"))?;
        Ok(Self::new(program.clone(), args.to_vec()))
    }
}

#[async_trait]
impl JobHandler for CommandHandler {
    async fn run(
        &self,
        job: &Job,
        ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, ExecutionError> {
        if ctx.cancel_requested() {
            return Err(ExecutionError::Canceled);
        }

        debug!(job_id = %job.id, program = %self.program, "launching engine");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutionError::Failed(format!("failed to spawn engine: {e}")))?;

        let payload = serde_json::to_vec(&job.payload)
            .map_err(|e| ExecutionError::Failed(format!("payload not serializable: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .await
                .map_err(|e| ExecutionError::Failed(format!("failed to write payload: {e}")))?;
            // Dropping stdin closes the pipe so the engine sees EOF.
        }

        // Drain pipes concurrently with the wait; an engine that logs more
        // than the pipe buffer would otherwise deadlock against us.
        let stdout_task = child.stdout.take().map(|mut pipe| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = pipe.read_to_string(&mut buf).await;
                buf
            })
        });
        let stderr_task = child.stderr.take().map(|mut pipe| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = pipe.read_to_string(&mut buf).await;
                buf
            })
        });

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = ctx.cancelled() => None,
        };

        let status = match waited {
            Some(status) => status
                .map_err(|e| ExecutionError::Failed(format!("engine wait failed: {e}")))?,
            None => {
                if let Err(e) = child.kill().await {
                    warn!(job_id = %job.id, "failed to kill engine process: {e}");
                }
                return Err(ExecutionError::Canceled);
            }
        };

        let stdout = match stdout_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            let stderr = match stderr_task {
                Some(task) => task.await.unwrap_or_default(),
                None => String::new(),
            };
            let detail = stderr.trim();
            return Err(ExecutionError::Failed(if detail.is_empty() {
                format!("engine exited with {status}")
            } else {
                format!("engine exited with {status}: {detail}")
            }));
        }

        let out = stdout.trim();
        if out.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        // Engines that emit plain text instead of JSON still get their
        // output recorded.
        Ok(serde_json::from_str(out).unwrap_or_else(|_| serde_json::Value::String(out.to_string())))
    }
}

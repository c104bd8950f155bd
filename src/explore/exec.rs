// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Shell-free process execution.
//!
//! Every external process the engine starts (git, the container engine) goes
//! through a [`CommandRunner`]. Arguments travel as a vector straight to
//! `execve`, so nothing is ever interpreted by a shell. Each run is bounded by
//! a timeout and an output cap; exceeding either kills the child and yields a
//! distinct [`ExecError`] so callers can tell it apart from a plain failure.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

#[cfg(feature = "telemetry")]
use tracing::instrument;

use crate::error::ExecError;
use crate::telemetry::Metrics;

/// Default timeout for a single command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Default cap on captured bytes per output stream.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// A program invocation described as an argument vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Overrides the runner's default timeout for this call.
    pub timeout: Option<Duration>,
}

impl CommandRequest {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Short human-readable form for logs and error messages.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().take(4).cloned());
        if self.args.len() > 4 {
            parts.push("...".to_string());
        }
        parts.join(" ")
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl CommandOutput {
    /// Build a successful output, mostly useful for test doubles.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    /// Build a failed output, mostly useful for test doubles.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(code),
            stderr: stderr.into(),
            ..Default::default()
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Trimmed stdout.
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

/// Executes commands without a shell.
///
/// Implementations return `Ok` for any process that ran to completion,
/// whatever its exit code. Spawn failures, timeouts and output overflow are
/// errors.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, request: &CommandRequest) -> Result<CommandOutput, ExecError>;
}

/// Run a command and turn a non-zero exit into [`ExecError::Failed`].
pub async fn run_checked(
    runner: &dyn CommandRunner,
    request: &CommandRequest,
) -> Result<CommandOutput, ExecError> {
    let output = runner.run(request).await?;
    if output.success() {
        Ok(output)
    } else {
        Err(ExecError::Failed {
            program: request.program.clone(),
            code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        })
    }
}

/// Production [`CommandRunner`] backed by `tokio::process`.
#[derive(Debug, Clone)]
pub struct SafeExecutor {
    timeout: Duration,
    max_output_bytes: usize,
    metrics: Arc<Metrics>,
}

impl Default for SafeExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl SafeExecutor {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_COMMAND_TIMEOUT,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            metrics: Arc::new(Metrics::new()),
        }
    }

    /// Set the default timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the per-stream output cap.
    pub fn with_max_output_bytes(mut self, limit: usize) -> Self {
        self.max_output_bytes = limit;
        self
    }

    /// Share a metrics collector with other components.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    async fn execute(&self, request: &CommandRequest) -> Result<CommandOutput, ExecError> {
        let start = Instant::now();
        let limit = self.max_output_bytes;
        let timeout_duration = request.timeout.unwrap_or(self.timeout);

        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &request.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
            program: request.program.clone(),
            source,
        })?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let outcome = timeout(timeout_duration, async {
            let (out, err) =
                tokio::try_join!(read_capped(stdout, limit), read_capped(stderr, limit))?;
            let status = child.wait().await.map_err(Capture::Io)?;
            Ok::<_, Capture>((out, err, status))
        })
        .await;

        match outcome {
            Ok(Ok((out, err, status))) => Ok(CommandOutput {
                exit_code: status.code(),
                stdout: String::from_utf8_lossy(&out).into_owned(),
                stderr: String::from_utf8_lossy(&err).into_owned(),
                duration: start.elapsed(),
            }),
            Ok(Err(Capture::Overflow)) => {
                let _ = child.kill().await;
                warn!(command = %request.display(), limit, "Command output exceeded limit");
                Err(ExecError::OutputOverflow {
                    program: request.program.clone(),
                    limit,
                })
            }
            Ok(Err(Capture::Io(source))) => {
                let _ = child.kill().await;
                Err(ExecError::Io {
                    program: request.program.clone(),
                    source,
                })
            }
            Err(_) => {
                let _ = child.kill().await;
                warn!(
                    command = %request.display(),
                    timeout_ms = timeout_duration.as_millis() as u64,
                    "Command timed out"
                );
                Err(ExecError::Timeout {
                    program: request.program.clone(),
                    timeout_ms: timeout_duration.as_millis() as u64,
                })
            }
        }
    }
}

#[async_trait]
impl CommandRunner for SafeExecutor {
    #[cfg_attr(feature = "telemetry", instrument(skip(self, request), fields(program = %request.program)))]
    async fn run(&self, request: &CommandRequest) -> Result<CommandOutput, ExecError> {
        let start = Instant::now();
        let result = self.execute(request).await;

        let success = matches!(&result, Ok(output) if output.success());
        self.metrics
            .record_command(&request.program, start.elapsed(), success);

        match &result {
            Ok(output) => debug!(
                command = %request.display(),
                exit_code = ?output.exit_code,
                duration_ms = output.duration.as_millis() as u64,
                "Command finished"
            ),
            Err(e) => debug!(command = %request.display(), error = %e, "Command failed to complete"),
        }
        result
    }
}

enum Capture {
    Overflow,
    Io(std::io::Error),
}

async fn read_capped<R>(reader: Option<R>, limit: usize) -> Result<Vec<u8>, Capture>
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return Ok(Vec::new());
    };
    let mut buf = Vec::new();
    reader
        .take(limit as u64 + 1)
        .read_to_end(&mut buf)
        .await
        .map_err(Capture::Io)?;
    if buf.len() > limit {
        return Err(Capture::Overflow);
    }
    Ok(buf)
}

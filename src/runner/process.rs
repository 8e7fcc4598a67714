use super::CommandSpec;
use crate::errors::RunnerError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;

/// Captured result of one finished child process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout followed by stderr, for pattern checks that don't care which stream.
    pub fn combined(&self) -> String {
        let mut s = self.stdout.clone();
        if !s.is_empty() && !self.stderr.is_empty() && !s.ends_with('\n') {
            s.push('\n');
        }
        s.push_str(&self.stderr);
        s
    }
}

/// Executes exactly one external command and reports what happened.
///
/// Implementations never interpret the exit code: a nonzero status is returned
/// as a normal `CommandOutput`. `Err` means the command could not be launched,
/// could not be waited on, or exceeded the caller-supplied timeout.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        spec: &CommandSpec,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, RunnerError>;
}

/// Runs commands as child processes via `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    /// Environment applied to every child before the command's own overrides
    /// (cloud profile and region selection).
    base_env: Vec<(String, String)>,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_env(base_env: Vec<(String, String)>) -> Self {
        Self { base_env }
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        spec: &CommandSpec,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, RunnerError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        for (key, value) in &self.base_env {
            cmd.env(key, value);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if let Some(ref dir) = spec.cwd {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(command = %spec.display(), cwd = ?spec.cwd, "spawning");
        let start = Instant::now();

        let child = cmd.spawn().map_err(|source| RunnerError::Launch {
            program: spec.program.clone(),
            source,
        })?;

        // Dropping the wait future on timeout drops the child, which kills it.
        let waited = match timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| RunnerError::Timeout {
                    program: spec.program.clone(),
                    seconds: limit.as_secs(),
                })?,
            None => child.wait_with_output().await,
        };
        let output = waited.map_err(|source| RunnerError::Io {
            program: spec.program.clone(),
            source,
        })?;

        let result = CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration_ms: start.elapsed().as_millis() as u64,
        };
        tracing::debug!(
            command = %spec.display(),
            exit_code = ?result.exit_code,
            duration_ms = result.duration_ms,
            "exited"
        );
        Ok(result)
    }
}

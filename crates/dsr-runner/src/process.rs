//! The process runner: spawn, capture, bound by timeout.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use crate::CommandSpec;

/// Process-level failures, below the dsr error taxonomy. The executor maps
/// these into the build/network/timeout classes with target context.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("failed to spawn '{program}': {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("process timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("I/O error while running process: {0}")]
    Io(#[from] std::io::Error),
}

/// Captured output of one process execution.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Exit code; `None` when terminated by signal.
    pub exit_code: Option<i32>,
    pub duration: Duration,
}

impl ProcessOutput {
    #[must_use]
    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    #[must_use]
    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }

    /// Last `n` lines of stderr, for error reporting.
    #[must_use]
    pub fn stderr_tail(&self, n: usize) -> String {
        let text = self.stderr_string();
        let lines: Vec<&str> = text.lines().collect();
        let start = lines.len().saturating_sub(n);
        lines[start..].join("\n")
    }

    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Trait for process execution.
///
/// Implementations must use argv-style APIs only; `CommandSpec` carries the
/// arguments as discrete elements and nothing may flatten them into a shell
/// string. Tests substitute a mock.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Execute a command, bounded by `timeout`.
    ///
    /// Returns `Ok` when the process ran to completion, including nonzero
    /// exits; `Err(RunnerError::Timeout)` when the bound expired (the
    /// process is killed first).
    async fn run(&self, cmd: &CommandSpec, timeout: Duration) -> Result<ProcessOutput, RunnerError>;
}

/// The production runner on top of `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct TokioRunner;

#[async_trait]
impl ProcessRunner for TokioRunner {
    async fn run(&self, cmd: &CommandSpec, timeout: Duration) -> Result<ProcessOutput, RunnerError> {
        debug!(command = %cmd.display(), timeout_secs = timeout.as_secs(), "spawning process");
        let started = Instant::now();

        let mut child = cmd
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RunnerError::SpawnFailed {
                program: cmd.program.to_string_lossy().into_owned(),
                reason: e.to_string(),
            })?;

        let waited = tokio::time::timeout(timeout, child.wait_with_output()).await;
        match waited {
            Ok(output) => {
                let output = output?;
                Ok(ProcessOutput {
                    stdout: output.stdout,
                    stderr: output.stderr,
                    exit_code: output.status.code(),
                    duration: started.elapsed(),
                })
            }
            // wait_with_output consumed the child; kill_on_drop tears the
            // process down when the future is dropped by the timeout.
            Err(_) => Err(RunnerError::Timeout {
                timeout_secs: timeout.as_secs(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stderr_tail_keeps_last_lines() {
        let output = ProcessOutput {
            stdout: Vec::new(),
            stderr: b"one\ntwo\nthree\nfour".to_vec(),
            exit_code: Some(1),
            duration: Duration::from_millis(5),
        };
        assert_eq!(output.stderr_tail(2), "three\nfour");
        assert_eq!(output.stderr_tail(10), "one\ntwo\nthree\nfour");
    }

    #[test]
    fn success_requires_zero_exit() {
        let mut output = ProcessOutput {
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code: Some(0),
            duration: Duration::ZERO,
        };
        assert!(output.success());
        output.exit_code = Some(2);
        assert!(!output.success());
        output.exit_code = None;
        assert!(!output.success());
    }

    #[tokio::test]
    async fn runner_reports_missing_program_as_spawn_failure() {
        let runner = TokioRunner;
        let cmd = CommandSpec::new("dsr-test-no-such-binary-on-path");
        let err = runner.run(&cmd, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, RunnerError::SpawnFailed { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runner_captures_output_and_exit() {
        let runner = TokioRunner;
        let cmd = CommandSpec::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]);
        let output = runner.run(&cmd, Duration::from_secs(5)).await.unwrap();
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stdout_string().trim(), "out");
        assert_eq!(output.stderr_string().trim(), "err");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runner_times_out_long_process() {
        let runner = TokioRunner;
        let cmd = CommandSpec::new("sleep").arg("30");
        let err = runner
            .run(&cmd, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Timeout { .. }));
    }
}

// src/utils/shell.rs
use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, trace, warn};

use crate::core::ToolOutcome;

/// Captured output of a finished process
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Seam between the stages and the operating system's process table
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Check whether a program can be launched at all
    async fn is_available(&self, program: &str) -> bool;

    /// Run a program to completion, or until the timeout elapses.
    /// A non-zero exit status is still a `Success`; callers decide what it means.
    async fn run(&self, program: &str, args: &[String], timeout: Duration) -> ToolOutcome<CommandOutput>;
}

/// Runs real processes through tokio
#[derive(Debug, Clone)]
pub struct SystemCommandRunner {
    probe_timeout: Duration,
}

impl SystemCommandRunner {
    /// Create a new runner; `probe_timeout` bounds the `--version` availability probe
    pub fn new(probe_timeout: Duration) -> Self {
        Self { probe_timeout }
    }
}

impl Default for SystemCommandRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn is_available(&self, program: &str) -> bool {
        let args = vec!["--version".to_string()];
        match self.run(program, &args, self.probe_timeout).await {
            ToolOutcome::Success(_) => true,
            ToolOutcome::TimedOut { .. } => {
                // Launched but slow to answer; it exists
                debug!("{} --version did not answer within {:?}", program, self.probe_timeout);
                true
            }
            outcome => {
                debug!("{} is not available: {}", program, outcome);
                false
            }
        }
    }

    async fn run(&self, program: &str, args: &[String], timeout: Duration) -> ToolOutcome<CommandOutput> {
        debug!("Executing {} {} (timeout {:?})", program, args.join(" "), timeout);

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return ToolOutcome::Unavailable(format!("{} not found", program));
            }
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                return ToolOutcome::Unavailable(format!("permission denied launching {}", program));
            }
            Err(e) => return ToolOutcome::Failed(format!("failed to launch {}: {}", program, e)),
        };

        // Dropping the child on timeout kills it
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let output = CommandOutput {
                    status: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                };
                if output.success() {
                    trace!("Command succeeded: {}", program);
                } else {
                    warn!("{} exited with {:?}: {}", program, output.status, output.stderr.trim());
                }
                ToolOutcome::Success(output)
            }
            Ok(Err(e)) => ToolOutcome::Failed(format!("failed waiting for {}: {}", program, e)),
            Err(_) => {
                warn!("{} timed out after {} seconds", program, timeout.as_secs());
                ToolOutcome::TimedOut { partial: None }
            }
        }
    }
}

/// Build an owned argument vector
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_program_is_unavailable() {
        let runner = SystemCommandRunner::default();
        let outcome = runner
            .run("surfacewatch-no-such-binary", &args(["--help"]), Duration::from_secs(2))
            .await;
        assert!(outcome.is_unavailable());
        assert!(!runner.is_available("surfacewatch-no-such-binary").await);
    }

    #[tokio::test]
    async fn test_captures_output_and_exit_status() {
        let runner = SystemCommandRunner::default();
        let outcome = runner
            .run("sh", &args(["-c", "echo hello; exit 3"]), Duration::from_secs(5))
            .await;
        match outcome {
            ToolOutcome::Success(output) => {
                assert_eq!(output.stdout.trim(), "hello");
                assert_eq!(output.status, Some(3));
                assert!(!output.success());
            }
            other => panic!("unexpected outcome: {}", other),
        }
    }

    #[tokio::test]
    async fn test_slow_program_times_out() {
        let runner = SystemCommandRunner::default();
        let outcome = runner
            .run("sleep", &args(["5"]), Duration::from_millis(100))
            .await;
        assert!(matches!(outcome, ToolOutcome::TimedOut { .. }));
    }
}

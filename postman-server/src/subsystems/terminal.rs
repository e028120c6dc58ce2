//! Terminal Runner: the narrow seam between the orchestrator and tmux.
//!
//! Everything the orchestrator does to a terminal goes through
//! [`TerminalRunner`], so tests swap in an in-memory fake.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

use postman_core::config::TerminalConfig;

#[derive(Error, Debug)]
pub enum TerminalError {
    #[error("failed to run {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tmux {command} timed out after {secs}s")]
    Timeout { command: &'static str, secs: u64 },

    #[error("tmux {command} failed (exit {code:?}): {stderr}")]
    CommandFailed {
        command: &'static str,
        code: Option<i32>,
        stderr: String,
    },
}

// ============================================================================
// TerminalRunner trait
// ============================================================================

#[async_trait]
pub trait TerminalRunner: Send + Sync {
    /// Start a detached session named `name` with `dir` as its cwd.
    async fn new_session(&self, name: &str, dir: &str) -> Result<(), TerminalError>;

    /// Type `text` into the session and press Enter.
    async fn send_keys(&self, name: &str, text: &str) -> Result<(), TerminalError>;

    /// The last `max_lines` lines of the session's pane.
    async fn capture_pane(&self, name: &str, max_lines: u32) -> Result<String, TerminalError>;

    async fn kill_session(&self, name: &str) -> Result<(), TerminalError>;

    /// `false` covers both "no such session" and "tmux unreachable".
    async fn has_session(&self, name: &str) -> bool;
}

// ============================================================================
// TmuxRunner
// ============================================================================

/// Drives the real `tmux` binary. Every invocation is bounded by
/// `command_timeout_secs`.
#[derive(Debug, Clone)]
pub struct TmuxRunner {
    binary: String,
    timeout: Duration,
}

impl TmuxRunner {
    pub fn new(config: &TerminalConfig) -> Self {
        Self {
            binary: config.tmux_binary.clone(),
            timeout: Duration::from_secs(config.command_timeout_secs),
        }
    }

    async fn run(&self, command: &'static str, args: &[&str]) -> Result<String, TerminalError> {
        let output = Command::new(&self.binary)
            .arg(command)
            .args(args)
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, output).await {
            Ok(res) => res.map_err(|source| TerminalError::Spawn {
                binary: self.binary.clone(),
                source,
            })?,
            Err(_) => {
                return Err(TerminalError::Timeout {
                    command,
                    secs: self.timeout.as_secs(),
                })
            }
        };

        if !output.status.success() {
            return Err(TerminalError::CommandFailed {
                command,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl TerminalRunner for TmuxRunner {
    async fn new_session(&self, name: &str, dir: &str) -> Result<(), TerminalError> {
        self.run("new-session", &["-d", "-s", name, "-c", dir]).await?;
        Ok(())
    }

    async fn send_keys(&self, name: &str, text: &str) -> Result<(), TerminalError> {
        self.run("send-keys", &["-t", name, text, "Enter"]).await?;
        Ok(())
    }

    async fn capture_pane(&self, name: &str, max_lines: u32) -> Result<String, TerminalError> {
        let start = format!("-{}", max_lines);
        self.run("capture-pane", &["-t", name, "-p", "-S", &start]).await
    }

    async fn kill_session(&self, name: &str) -> Result<(), TerminalError> {
        self.run("kill-session", &["-t", name]).await?;
        Ok(())
    }

    async fn has_session(&self, name: &str) -> bool {
        match self.run("has-session", &["-t", name]).await {
            Ok(_) => true,
            Err(TerminalError::CommandFailed { .. }) => false,
            Err(e) => {
                tracing::warn!(session = %name, error = %e, "tmux has-session could not run");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner(binary: &str, secs: u64) -> TmuxRunner {
        TmuxRunner::new(&TerminalConfig {
            tmux_binary: binary.to_string(),
            command_timeout_secs: secs,
        })
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let runner = runner("/nonexistent/tmux-binary", 1);
        let err = runner.new_session("s", "/tmp").await.unwrap_err();
        assert!(matches!(err, TerminalError::Spawn { .. }), "got {:?}", err);
        assert!(!runner.has_session("s").await);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_command_failed() {
        // `false` ignores its arguments and exits 1.
        let runner = runner("false", 5);
        let err = runner.kill_session("s").await.unwrap_err();
        match err {
            TerminalError::CommandFailed { command, code, .. } => {
                assert_eq!(command, "kill-session");
                assert_eq!(code, Some(1));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!runner.has_session("s").await);
    }

    #[tokio::test]
    async fn test_capture_returns_stdout() {
        // `echo` prints its arguments, standing in for tmux output.
        let runner = runner("echo", 5);
        let out = runner.capture_pane("s", 50).await.unwrap();
        assert_eq!(out.trim(), "capture-pane -t s -p -S -50");
    }
}

//! Host shell execution
//!
//! One primitive: run a command string, capture stdout/stderr, enforce a
//! timeout. No persistent shell sessions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Maximum output length to capture per stream
const MAX_OUTPUT_CHARS: usize = 64 * 1024;

/// Shell errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ShellError {
    #[error("Failed to start '{command}': {message}")]
    Spawn { command: String, message: String },

    #[error("'{command}' timed out after {secs} seconds")]
    Timeout { command: String, secs: u64 },
}

/// Captured result of one command
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    /// Failed output with the given stderr
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(code),
            stderr: stderr.into(),
            ..Default::default()
        }
    }

    /// stdout, or stderr when stdout is empty
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (false, true) => self.stdout.trim().to_string(),
            (true, false) => self.stderr.trim().to_string(),
            (false, false) => format!("{}\n{}", self.stdout.trim(), self.stderr.trim()),
            (true, true) => String::new(),
        }
    }
}

/// Command execution backend
#[async_trait]
pub trait ShellRunner: Send + Sync {
    async fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput, ShellError>;
}

/// Runs commands on the real host (`sh -c` on unix, PowerShell on Windows)
#[derive(Debug, Default, Clone, Copy)]
pub struct HostShell;

impl HostShell {
    fn build(command: &str) -> tokio::process::Command {
        #[cfg(windows)]
        {
            let mut cmd = tokio::process::Command::new("powershell.exe");
            cmd.args(["-NoProfile", "-NonInteractive", "-Command", command]);
            cmd
        }
        #[cfg(not(windows))]
        {
            let mut cmd = tokio::process::Command::new("sh");
            cmd.args(["-c", command]);
            cmd
        }
    }
}

#[async_trait]
impl ShellRunner for HostShell {
    async fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput, ShellError> {
        let start = Instant::now();
        let mut cmd = Self::build(command);
        cmd.kill_on_drop(true);

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| ShellError::Timeout {
                command: command.to_string(),
                secs: timeout.as_secs(),
            })?
            .map_err(|e| ShellError::Spawn {
                command: command.to_string(),
                message: e.to_string(),
            })?;

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: truncate_chars(&String::from_utf8_lossy(&output.stdout), MAX_OUTPUT_CHARS),
            stderr: truncate_chars(&String::from_utf8_lossy(&output.stderr), MAX_OUTPUT_CHARS),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

/// Truncate to `max` characters without splitting a code point
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let snippet: String = s.chars().take(max).collect();
        format!("{}\n… (truncated)", snippet)
    }
}

/// Scripted shell for tests
///
/// Commands containing a registered pattern get the scripted output;
/// everything else succeeds with empty output.
#[derive(Default)]
pub struct FakeShell {
    responses: Mutex<Vec<(String, Result<CommandOutput, ShellError>)>>,
    calls: Mutex<Vec<String>>,
    gate: Option<Arc<tokio::sync::Notify>>,
}

impl FakeShell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, pattern: &str, output: CommandOutput) -> Self {
        self.push(pattern, Ok(output))
    }

    pub fn fail_on(self, pattern: &str) -> Self {
        self.push(pattern, Ok(CommandOutput::failed(1, format!("{} failed", pattern))))
    }

    pub fn error_on(self, pattern: &str, error: ShellError) -> Self {
        self.push(pattern, Err(error))
    }

    /// Every command waits for a notification before returning
    pub fn with_gate(mut self, gate: Arc<tokio::sync::Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn push(self, pattern: &str, result: Result<CommandOutput, ShellError>) -> Self {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push((pattern.to_string(), result));
        }
        self
    }
}

#[async_trait]
impl ShellRunner for FakeShell {
    async fn run(&self, command: &str, _timeout: Duration) -> Result<CommandOutput, ShellError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(command.to_string());
        }
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let scripted = self.responses.lock().ok().and_then(|responses| {
            responses
                .iter()
                .find(|(pattern, _)| command.contains(pattern.as_str()))
                .map(|(_, result)| result.clone())
        });
        scripted.unwrap_or_else(|| Ok(CommandOutput::ok("")))
    }
}

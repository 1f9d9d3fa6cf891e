//! Request and result types for remote execution.
//!
//! Results implement `Serialize` so workflow code and the CLI can emit them
//! as JSON without a translation layer.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{RemoteError, Stage};
use super::identity::HostIdentity;

/// How a command is run on the remote host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Block until the command exits, capturing its output
    Sync,
    /// Start the command inside a named tmux session and return immediately
    Detached,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Sync => write!(f, "sync"),
            ExecutionMode::Detached => write!(f, "detached"),
        }
    }
}

/// A single execution against a resolved identity. Built per call.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub identity: HostIdentity,
    pub command: String,
    pub mode: ExecutionMode,
    /// tmux session name for detached runs; derived when absent
    pub session_name: Option<String>,
    /// Overrides the configured command (sync) or spawn (detached) timeout
    pub timeout: Option<Duration>,
}

impl ExecutionRequest {
    pub fn sync(identity: HostIdentity, command: impl Into<String>) -> Self {
        Self {
            identity,
            command: command.into(),
            mode: ExecutionMode::Sync,
            session_name: None,
            timeout: None,
        }
    }

    pub fn detached(
        identity: HostIdentity,
        command: impl Into<String>,
        session_name: Option<String>,
    ) -> Self {
        Self {
            identity,
            command: command.into(),
            mode: ExecutionMode::Detached,
            session_name,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Raw output of one command dispatched over a session channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the server sent no exit status or the command timed out
    pub exit_code: Option<i32>,
    /// Partial output was collected before the command timeout fired
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn exited(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code: Some(exit_code),
            timed_out: false,
        }
    }

    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// The three states a detached run can end in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum DetachedOutcome {
    /// The wrapper did not create the tmux session
    SpawnFailed,
    /// The session exists; the PID lookup may or may not have succeeded
    Spawned { pid: Option<u32> },
}

/// Structured result handed back to the caller. Never retained by the core.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub mode: ExecutionMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    /// Command timeout that fired, set together with `timed_out`
    #[serde(skip)]
    pub timed_out_after: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_pid: Option<u32>,
    pub identity: String,
    /// Whether the command ran over a pooled session without reconnecting
    pub reused_session: bool,
    /// Error text when the request failed before reaching the remote side
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    pub(crate) fn from_output(
        mode: ExecutionMode,
        identity: &HostIdentity,
        output: CommandOutput,
        reused_session: bool,
    ) -> Self {
        Self {
            success: output.success(),
            mode,
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            timed_out: output.timed_out,
            timed_out_after: None,
            session_name: None,
            remote_pid: None,
            identity: identity.description(),
            reused_session,
            error: None,
        }
    }

    /// A failed result for a request that never reached the remote host.
    pub fn from_error(mode: ExecutionMode, identity: impl Into<String>, err: &RemoteError) -> Self {
        Self {
            success: false,
            mode,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            timed_out: false,
            timed_out_after: None,
            session_name: None,
            remote_pid: None,
            identity: identity.into(),
            reused_session: false,
            error: Some(err.to_string()),
        }
    }

    /// Outcome of a detached run, `None` for synchronous results.
    pub fn detached_outcome(&self) -> Option<DetachedOutcome> {
        match self.mode {
            ExecutionMode::Sync => None,
            ExecutionMode::Detached if self.success => Some(DetachedOutcome::Spawned {
                pid: self.remote_pid,
            }),
            ExecutionMode::Detached => Some(DetachedOutcome::SpawnFailed),
        }
    }

    /// Turn a failed result into an error for callers that want control flow.
    ///
    /// A command cut off by its timeout becomes `Timeout` at the command
    /// stage; the partial output is only available on the result itself.
    pub fn ensure_success(self) -> Result<Self, RemoteError> {
        if self.success {
            return Ok(self);
        }
        if self.timed_out {
            return Err(RemoteError::Timeout {
                identity: self.identity,
                stage: Stage::Command,
                after: self.timed_out_after.unwrap_or_default(),
            });
        }
        match self.mode {
            ExecutionMode::Detached => Err(RemoteError::DetachedSpawn {
                identity: self.identity,
                session_name: self.session_name.unwrap_or_default(),
                reason: self.error.unwrap_or(self.stderr),
            }),
            ExecutionMode::Sync => Err(RemoteError::CommandFailed {
                identity: self.identity,
                exit_code: self.exit_code,
                stderr: self.error.unwrap_or(self.stderr),
            }),
        }
    }
}

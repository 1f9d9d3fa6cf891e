//! Error taxonomy for remote execution.
//!
//! Errors fall into three classes that callers are expected to treat
//! differently:
//!
//! 1. **Configuration** (`Config`, `UnknownHost`): the inventory or the
//!    request is wrong. Fatal, never worth retrying.
//!
//! 2. **Connectivity** (`Connection`, `Timeout`, `GatewayUnreachable`): the
//!    network, the SSH handshake or authentication failed. The pool entry for
//!    the identity has already been invalidated when one of these reaches the
//!    caller, so a retry starts from scratch. Authentication failures are
//!    connectivity-class but are not retryable, see [`RemoteError::is_retryable`].
//!
//! 3. **Command outcome** (`CommandFailed`, `DetachedSpawn`): the remote side
//!    ran and reported failure. The runner returns these as data in
//!    `ExecutionResult`; they only become errors through
//!    `ExecutionResult::ensure_success`.

use std::fmt;
use std::time::Duration;

/// Stage of a connection or execution that carries its own timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// TCP connect to the SSH port (or tunnel open through a gateway)
    Tcp,
    /// SSH banner exchange and key exchange
    Banner,
    /// User authentication
    Auth,
    /// Remote command execution
    Command,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Tcp => write!(f, "tcp"),
            Stage::Banner => write!(f, "banner"),
            Stage::Auth => write!(f, "auth"),
            Stage::Command => write!(f, "command"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("host '{0}' not found in inventory")]
    UnknownHost(String),

    #[error("connection to {identity} failed: {reason}")]
    Connection { identity: String, reason: String },

    #[error("{stage} stage timed out after {after:?} for {identity}")]
    Timeout {
        identity: String,
        stage: Stage,
        after: Duration,
    },

    #[error("gateway {gateway} unreachable while connecting to {identity}: {reason}")]
    GatewayUnreachable {
        gateway: String,
        identity: String,
        reason: String,
    },

    #[error("failed to start detached session '{session_name}' on {identity}: {reason}")]
    DetachedSpawn {
        identity: String,
        session_name: String,
        reason: String,
    },

    #[error("command on {identity} exited with {exit_code:?}: {stderr}")]
    CommandFailed {
        identity: String,
        exit_code: Option<i32>,
        stderr: String,
    },
}

impl RemoteError {
    pub(crate) fn connection(identity: impl Into<String>, reason: impl Into<String>) -> Self {
        RemoteError::Connection {
            identity: identity.into(),
            reason: reason.into(),
        }
    }

    /// Configuration-class errors: abort, do not retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RemoteError::Config(_) | RemoteError::UnknownHost(_))
    }

    /// Connectivity-class errors, which invalidate the pooled session.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            RemoteError::Connection { .. }
                | RemoteError::Timeout { .. }
                | RemoteError::GatewayUnreachable { .. }
        )
    }

    /// Whether a caller may reasonably try the same request again.
    ///
    /// Timeouts and unreachable gateways are always retryable. Connection
    /// errors are retryable unless the reason looks like rejected credentials.
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Timeout { .. } | RemoteError::GatewayUnreachable { .. } => true,
            RemoteError::Connection { reason, .. } => is_retryable_reason(reason),
            _ => false,
        }
    }
}

/// Authentication error patterns that indicate permanent failures.
const AUTH_ERRORS: &[&str] = &[
    "authentication failed",
    "authentication rejected",
    "permission denied",
    "publickey",
    "auth fail",
    "no authentication",
    "all authentication methods failed",
    "failed to load private key",
];

/// Connection error patterns that indicate transient failures.
const RETRYABLE_ERRORS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timed out",
    "timeout",
    "network is unreachable",
    "no route to host",
    "host is down",
    "temporary failure",
    "resource temporarily unavailable",
    "handshake failed",
    "failed to connect",
    "broken pipe",
    "session closed",
];

/// Classify a connection failure message.
///
/// Authentication patterns are checked first and win over connection
/// patterns. Unknown messages are retryable unless they look like SSH
/// protocol errors without a connect/timeout hint.
pub(crate) fn is_retryable_reason(reason: &str) -> bool {
    let reason = reason.to_lowercase();

    if AUTH_ERRORS.iter().any(|p| reason.contains(p)) {
        return false;
    }

    if RETRYABLE_ERRORS.iter().any(|p| reason.contains(p)) {
        return true;
    }

    !reason.contains("ssh") || reason.contains("timeout") || reason.contains("connect")
}

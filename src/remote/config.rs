//! Connection tunables.
//!
//! Every value resolves with a three-tier priority:
//!
//! 1. **Parameter** - Explicitly provided value (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `TESTBED_CONNECT_TIMEOUT` | 30s | TCP connect timeout in seconds |
//! | `TESTBED_BANNER_TIMEOUT` | 15s | SSH banner/key exchange timeout in seconds |
//! | `TESTBED_AUTH_TIMEOUT` | 15s | Authentication timeout in seconds |
//! | `TESTBED_COMMAND_TIMEOUT` | 180s | Synchronous command timeout in seconds |
//! | `TESTBED_COMPRESSION` | true | Enable zlib compression |

use std::env;
use std::time::Duration;

use super::error::RemoteError;

pub(crate) const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
pub(crate) const DEFAULT_BANNER_TIMEOUT_SECS: u64 = 15;
pub(crate) const DEFAULT_AUTH_TIMEOUT_SECS: u64 = 15;
pub(crate) const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 180;

/// Spawn confirmation only has to wait for `tmux new-session -d` to return.
pub(crate) const DEFAULT_SPAWN_TIMEOUT_SECS: u64 = 30;
pub(crate) const DEFAULT_PID_LOOKUP_TIMEOUT_SECS: u64 = 10;
pub(crate) const DEFAULT_KEEPALIVE_SECS: u64 = 30;

pub(crate) const CONNECT_TIMEOUT_ENV_VAR: &str = "TESTBED_CONNECT_TIMEOUT";
pub(crate) const BANNER_TIMEOUT_ENV_VAR: &str = "TESTBED_BANNER_TIMEOUT";
pub(crate) const AUTH_TIMEOUT_ENV_VAR: &str = "TESTBED_AUTH_TIMEOUT";
pub(crate) const COMMAND_TIMEOUT_ENV_VAR: &str = "TESTBED_COMMAND_TIMEOUT";
pub(crate) const COMPRESSION_ENV_VAR: &str = "TESTBED_COMPRESSION";

/// Every recognized connection and execution tunable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub connect_timeout: Duration,
    pub banner_timeout: Duration,
    pub auth_timeout: Duration,
    /// Upper bound for a synchronous command
    pub command_timeout: Duration,
    /// Upper bound for the detached spawn-confirmation round trip
    pub spawn_timeout: Duration,
    pub pid_lookup_timeout: Duration,
    pub keepalive_interval: Duration,
    pub compression: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            banner_timeout: Duration::from_secs(DEFAULT_BANNER_TIMEOUT_SECS),
            auth_timeout: Duration::from_secs(DEFAULT_AUTH_TIMEOUT_SECS),
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            spawn_timeout: Duration::from_secs(DEFAULT_SPAWN_TIMEOUT_SECS),
            pid_lookup_timeout: Duration::from_secs(DEFAULT_PID_LOOKUP_TIMEOUT_SECS),
            keepalive_interval: Duration::from_secs(DEFAULT_KEEPALIVE_SECS),
            compression: true,
        }
    }
}

impl ConnectionOptions {
    /// Resolve options, letting explicit values override env vars.
    pub fn resolve(
        connect_timeout_secs: Option<u64>,
        command_timeout_secs: Option<u64>,
    ) -> Result<Self, RemoteError> {
        let options = Self {
            connect_timeout: resolve_secs(
                connect_timeout_secs,
                CONNECT_TIMEOUT_ENV_VAR,
                DEFAULT_CONNECT_TIMEOUT_SECS,
            ),
            banner_timeout: resolve_secs(
                None,
                BANNER_TIMEOUT_ENV_VAR,
                DEFAULT_BANNER_TIMEOUT_SECS,
            ),
            auth_timeout: resolve_secs(None, AUTH_TIMEOUT_ENV_VAR, DEFAULT_AUTH_TIMEOUT_SECS),
            command_timeout: resolve_secs(
                command_timeout_secs,
                COMMAND_TIMEOUT_ENV_VAR,
                DEFAULT_COMMAND_TIMEOUT_SECS,
            ),
            compression: resolve_compression(None),
            ..Self::default()
        };
        options.validate()?;
        Ok(options)
    }

    /// Reject values that would make a stage time out immediately.
    pub fn validate(&self) -> Result<(), RemoteError> {
        let durations = [
            ("connect_timeout", self.connect_timeout),
            ("banner_timeout", self.banner_timeout),
            ("auth_timeout", self.auth_timeout),
            ("command_timeout", self.command_timeout),
            ("spawn_timeout", self.spawn_timeout),
            ("pid_lookup_timeout", self.pid_lookup_timeout),
            ("keepalive_interval", self.keepalive_interval),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(RemoteError::Config(format!("{} must be non-zero", name)));
            }
        }
        Ok(())
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }
}

/// Resolve a duration in seconds with priority: parameter -> env var -> default
pub(crate) fn resolve_secs(param: Option<u64>, env_var: &str, default: u64) -> Duration {
    if let Some(secs) = param {
        return Duration::from_secs(secs);
    }

    if let Ok(value) = env::var(env_var)
        && let Ok(secs) = value.parse::<u64>()
    {
        return Duration::from_secs(secs);
    }

    Duration::from_secs(default)
}

/// Resolve the compression setting with priority: parameter -> env var -> default (true)
pub(crate) fn resolve_compression(param: Option<bool>) -> bool {
    if let Some(compress) = param {
        return compress;
    }

    if let Ok(value) = env::var(COMPRESSION_ENV_VAR) {
        return value.eq_ignore_ascii_case("true") || value == "1";
    }

    true
}

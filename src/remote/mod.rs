//! Remote execution and host orchestration.
//!
//! This module is organized into the following submodules:
//!
//! - `inventory`: Static host inventory (`HostRegistry`) loaded from YAML
//! - `ssh_config`: Lookup of OpenSSH client aliases for externally configured hosts
//! - `gateway`: Identity construction for jump hosts and two-stage connects
//! - `pool`: `ConnectionPool`, one live session per identity behind a per-identity lock
//! - `runner`: `CommandRunner`, synchronous and tmux-detached execution
//! - `executor`: `HostExecutor`, the host-name level facade used by workflows
//! - `client` / `session` / `auth`: the russh transport
//! - `config`: `ConnectionOptions` resolved from parameters, env vars and defaults
//! - `error`: `RemoteError` and its classification

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod identity;
pub mod inventory;
#[cfg(test)]
pub(crate) mod mock;
pub mod pool;
pub mod runner;
pub mod session;
pub mod ssh_config;
pub mod tmux;
pub mod transport;
pub mod types;

pub use config::ConnectionOptions;
pub use error::{RemoteError, Stage};
pub use executor::HostExecutor;
pub use identity::{Credential, HostIdentity};
pub use inventory::{HostProfile, HostRegistry};
pub use pool::ConnectionPool;
pub use runner::CommandRunner;
pub use types::{ExecutionMode, ExecutionRequest, ExecutionResult};

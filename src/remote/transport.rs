//! Transport seams between the pool and the SSH implementation.
//!
//! The pool, gateway and runner only talk to these traits. The production
//! implementation lives in `client` and `session` (russh); tests substitute
//! an in-memory double.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use super::config::ConnectionOptions;
use super::error::RemoteError;
use super::identity::HostIdentity;
use super::types::CommandOutput;

/// Byte stream carrying a tunneled SSH connection.
pub trait TunnelIo: AsyncRead + AsyncWrite + Send + 'static {}

impl<T> TunnelIo for T where T: AsyncRead + AsyncWrite + Send + 'static {}

pub type TunnelStream = Pin<Box<dyn TunnelIo>>;

/// An open, authenticated session bound to one identity.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Run `command` on a fresh channel and collect its output.
    ///
    /// A command that outlives `timeout` is not an error: partial output is
    /// returned with `timed_out` set. Errors mean the session itself failed.
    async fn exec(&self, command: &str, timeout: Duration) -> Result<CommandOutput, RemoteError>;

    /// Open a `direct-tcpip` stream to `host:port` as seen from this session.
    async fn open_tunnel(&self, host: &str, port: u16) -> Result<TunnelStream, RemoteError>;

    /// Cheap local liveness check, no network round trip.
    fn is_alive(&self) -> bool;

    async fn close(&self) -> Result<(), RemoteError>;
}

/// Opens sessions for identities.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect straight to `identity` over TCP.
    async fn connect(
        &self,
        identity: &HostIdentity,
        options: &ConnectionOptions,
    ) -> Result<Arc<dyn RemoteSession>, RemoteError>;

    /// Connect to `identity` through a tunnel opened on `gateway`.
    ///
    /// The returned session keeps `gateway` alive for as long as it lives.
    async fn connect_through(
        &self,
        gateway: Arc<dyn RemoteSession>,
        identity: &HostIdentity,
        options: &ConnectionOptions,
    ) -> Result<Arc<dyn RemoteSession>, RemoteError>;
}

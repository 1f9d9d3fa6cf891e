//! russh-backed sessions.
//!
//! `SshClientHandler` accepts every host key, like `StrictHostKeyChecking=no`.
//! Testbed hosts are reinstalled often enough that pinning keys in
//! known_hosts would break every run after a reflash.
//!
//! `RusshSession` is the production [`RemoteSession`]: commands are
//! dispatched on a fresh channel per call, tunnels are `direct-tcpip`
//! channels, and liveness is read from the handle without a round trip.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::{ChannelMsg, Disconnect, client, keys};
use tracing::warn;

use super::error::RemoteError;
use super::transport::{RemoteSession, TunnelStream};
use super::types::CommandOutput;

pub struct SshClientHandler;

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

pub struct RusshSession {
    handle: client::Handle<SshClientHandler>,
    identity: String,
    // Held so the tunnel this session rides on outlives it.
    gateway: Option<Arc<dyn RemoteSession>>,
}

impl RusshSession {
    pub(crate) fn new(
        handle: client::Handle<SshClientHandler>,
        identity: String,
        gateway: Option<Arc<dyn RemoteSession>>,
    ) -> Self {
        Self {
            handle,
            identity,
            gateway,
        }
    }

    fn channel_error(&self, what: &str, e: russh::Error) -> RemoteError {
        RemoteError::connection(self.identity.clone(), format!("{}: {}", what, e))
    }
}

#[async_trait]
impl RemoteSession for RusshSession {
    async fn exec(&self, command: &str, timeout: Duration) -> Result<CommandOutput, RemoteError> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| self.channel_error("Failed to open channel", e))?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| self.channel_error("Failed to execute command", e))?;

        let mut stdout = Vec::with_capacity(4096);
        let mut stderr = Vec::with_capacity(1024);
        let mut exit_code: Option<u32> = None;

        let collected = tokio::time::timeout(timeout, async {
            loop {
                match channel.wait().await {
                    Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
                    // ext == 1 is stderr in SSH protocol
                    Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                        stderr.extend_from_slice(&data)
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => exit_code = Some(exit_status),
                    Some(ChannelMsg::Eof) if exit_code.is_some() => break,
                    Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                }
            }
        })
        .await;

        let timed_out = collected.is_err();
        if timed_out {
            warn!(
                "Command on {} timed out after {:?}, returning partial output ({} bytes stdout, {} bytes stderr)",
                self.identity,
                timeout,
                stdout.len(),
                stderr.len()
            );
        }

        // Close the channel either way; the session stays usable.
        let _ = channel.close().await;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).trim_end().to_string(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: if timed_out {
                None
            } else {
                exit_code.map(|c| c as i32)
            },
            timed_out,
        })
    }

    async fn open_tunnel(&self, host: &str, port: u16) -> Result<TunnelStream, RemoteError> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await
            .map_err(|e| self.channel_error("Failed to open direct-tcpip channel", e))?;

        Ok(Box::pin(channel.into_stream()))
    }

    fn is_alive(&self) -> bool {
        !self.handle.is_closed() && self.gateway.as_ref().is_none_or(|g| g.is_alive())
    }

    async fn close(&self) -> Result<(), RemoteError> {
        let result = self
            .handle
            .disconnect(Disconnect::ByApplication, "Session closed by pool", "en")
            .await
            .map_err(|e| self.channel_error("Disconnect failed", e));

        // The gateway stage belongs to this session alone.
        if let Some(gateway) = &self.gateway
            && let Err(e) = gateway.close().await
        {
            warn!("Closing gateway stage of {} failed: {}", self.identity, e);
        }

        result
    }
}

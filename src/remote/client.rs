//! russh connection establishment.
//!
//! ## Connection Lifecycle
//!
//! 1. **TCP**: connect to `address:port` (or open a `direct-tcpip` tunnel on
//!    a gateway session), bounded by `connect_timeout`.
//! 2. **Banner**: SSH version exchange and key exchange over that stream,
//!    bounded by `banner_timeout`.
//! 3. **Auth**: run the [`AuthChain`] built from the identity's credential,
//!    bounded by `auth_timeout`.
//!
//! Each stage that exceeds its budget fails with `RemoteError::Timeout`
//! naming the stage. There is no retry here: a failed connect surfaces to
//! the pool, which clears its entry so the next acquire starts fresh.

use std::sync::Arc;

use async_trait::async_trait;
use russh::client;
use tokio::net::TcpStream;
use tracing::{error, info};

use super::auth::{AuthChain, AuthStrategy};
use super::config::ConnectionOptions;
use super::error::{RemoteError, Stage};
use super::identity::HostIdentity;
use super::session::{RusshSession, SshClientHandler};
use super::transport::{Connector, RemoteSession, TunnelIo};

/// Build russh client configuration for pooled sessions.
///
/// Pooled sessions are long-lived, so there is no inactivity timeout; dead
/// peers are detected through keepalives instead.
pub(crate) fn build_client_config(options: &ConnectionOptions) -> Arc<client::Config> {
    let compression = if options.compression {
        (&[russh::compression::ZLIB, russh::compression::NONE][..]).into()
    } else {
        (&[russh::compression::NONE][..]).into()
    };

    let preferred = russh::Preferred {
        compression,
        ..Default::default()
    };

    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(options.keepalive_interval),
        keepalive_max: 3,
        preferred,
        ..Default::default()
    })
}

/// Production [`Connector`] speaking SSH through russh.
#[derive(Debug, Default, Clone, Copy)]
pub struct RusshConnector;

impl RusshConnector {
    /// Banner exchange and authentication over an already open stream.
    async fn handshake<S: TunnelIo + Unpin>(
        stream: S,
        identity: &HostIdentity,
        options: &ConnectionOptions,
        gateway: Option<Arc<dyn RemoteSession>>,
    ) -> Result<Arc<dyn RemoteSession>, RemoteError> {
        let description = identity.description();
        let config = build_client_config(options);

        let mut handle = tokio::time::timeout(
            options.banner_timeout,
            client::connect_stream(config, stream, SshClientHandler),
        )
        .await
        .map_err(|_| RemoteError::Timeout {
            identity: description.clone(),
            stage: Stage::Banner,
            after: options.banner_timeout,
        })?
        .map_err(|e| RemoteError::connection(&description, format!("SSH handshake failed: {}", e)))?;

        let chain = AuthChain::for_credential(&identity.credential);
        let accepted = tokio::time::timeout(
            options.auth_timeout,
            chain.authenticate(&mut handle, &identity.username),
        )
        .await
        .map_err(|_| RemoteError::Timeout {
            identity: description.clone(),
            stage: Stage::Auth,
            after: options.auth_timeout,
        })?
        .map_err(|e| RemoteError::connection(&description, e))?;

        if !accepted {
            return Err(RemoteError::connection(
                &description,
                "Authentication failed: no authentication methods succeeded",
            ));
        }

        info!("SSH session established to {}", description);
        Ok(Arc::new(RusshSession::new(handle, description, gateway)))
    }
}

#[async_trait]
impl Connector for RusshConnector {
    async fn connect(
        &self,
        identity: &HostIdentity,
        options: &ConnectionOptions,
    ) -> Result<Arc<dyn RemoteSession>, RemoteError> {
        let description = identity.description();

        let tcp = tokio::time::timeout(
            options.connect_timeout,
            TcpStream::connect((identity.address.as_str(), identity.port)),
        )
        .await
        .map_err(|_| RemoteError::Timeout {
            identity: description.clone(),
            stage: Stage::Tcp,
            after: options.connect_timeout,
        })?
        .map_err(|e| {
            error!("TCP connect to {} failed: {}", description, e);
            RemoteError::connection(&description, format!("Failed to connect: {}", e))
        })?;

        Self::handshake(tcp, identity, options, None).await
    }

    async fn connect_through(
        &self,
        gateway: Arc<dyn RemoteSession>,
        identity: &HostIdentity,
        options: &ConnectionOptions,
    ) -> Result<Arc<dyn RemoteSession>, RemoteError> {
        let stream = tokio::time::timeout(
            options.connect_timeout,
            gateway.open_tunnel(&identity.address, identity.port),
        )
        .await
        .map_err(|_| RemoteError::Timeout {
            identity: identity.description(),
            stage: Stage::Tcp,
            after: options.connect_timeout,
        })??;

        Self::handshake(stream, identity, options, Some(gateway)).await
    }
}

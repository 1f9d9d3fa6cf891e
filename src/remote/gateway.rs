//! Jump hosts.
//!
//! [`GatewayResolver`] turns inventory entries into identities, following
//! `gateway` references and `ssh_alias` flags. [`establish`] performs the
//! matching staged connect: the gateway session first, then the target
//! tunneled through it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{error, info, warn};

use super::config::ConnectionOptions;
use super::error::RemoteError;
use super::identity::{Credential, HostIdentity};
use super::inventory::{GatewaySpec, HostEntry};
use super::ssh_config::SshConfig;
use super::transport::{Connector, RemoteSession};

/// Used when neither the entry nor the defaults name a user.
pub(crate) const DEFAULT_USERNAME: &str = "root";
pub(crate) const DEFAULT_PORT: u16 = 22;

/// Builds identities for inventory entries.
pub struct GatewayResolver<'a> {
    defaults: &'a HostEntry,
    gateways: &'a BTreeMap<String, HostEntry>,
    hosts: &'a BTreeMap<String, HostEntry>,
    ssh_config_path: PathBuf,
    // Parsed on the first alias lookup only.
    ssh_config: Option<SshConfig>,
}

impl<'a> GatewayResolver<'a> {
    pub(crate) fn new(
        defaults: &'a HostEntry,
        gateways: &'a BTreeMap<String, HostEntry>,
        hosts: &'a BTreeMap<String, HostEntry>,
        ssh_config_path: &Path,
    ) -> Self {
        Self {
            defaults,
            gateways,
            hosts,
            ssh_config_path: ssh_config_path.to_path_buf(),
            ssh_config: None,
        }
    }

    pub fn resolve_host(&mut self, name: &str) -> Result<HostIdentity, RemoteError> {
        let hosts = self.hosts;
        let entry = hosts
            .get(name)
            .ok_or_else(|| RemoteError::UnknownHost(name.to_string()))?;
        let mut chain = vec![name.to_string()];
        self.resolve_entry(name, entry, true, &mut chain)
    }

    fn resolve_entry(
        &mut self,
        name: &str,
        entry: &HostEntry,
        inherit_gateway: bool,
        chain: &mut Vec<String>,
    ) -> Result<HostIdentity, RemoteError> {
        let defaults = self.defaults;
        let merged = entry.merged(defaults, inherit_gateway);
        if merged.proxy_command.is_some() {
            return Err(RemoteError::Config(format!(
                "host '{}' sets proxy_command, which is not supported; \
                 use 'gateway' or 'ssh_alias' instead",
                name
            )));
        }
        let credential = credential_for(&merged);
        let username = merged
            .username
            .clone()
            .unwrap_or_else(|| DEFAULT_USERNAME.to_string());
        let port = merged.port.unwrap_or(DEFAULT_PORT);

        // Alias hosts take everything, gateway included, from the ssh config.
        if let Some(alias) = &merged.ssh_alias {
            let address = merged.address.clone().unwrap_or_else(|| alias.clone());
            let fallback = HostIdentity::new(address, username, port).with_credential(credential);
            return self.ssh_config()?.identity_for(alias, &fallback);
        }

        let address = merged.address.clone().ok_or_else(|| {
            RemoteError::Config(format!("host '{}' has no address", name))
        })?;
        let identity = HostIdentity::new(address, username, port).with_credential(credential);

        match &merged.gateway {
            None => Ok(identity),
            Some(GatewaySpec::Named(gateway)) => {
                if chain.iter().any(|seen| seen == gateway) {
                    return Err(RemoteError::Config(format!(
                        "gateway cycle: {} -> {}",
                        chain.join(" -> "),
                        gateway
                    )));
                }
                let (gateways, hosts) = (self.gateways, self.hosts);
                let (gateway_entry, is_gateway) = match gateways.get(gateway) {
                    Some(entry) => (entry, true),
                    None => match hosts.get(gateway) {
                        Some(entry) => (entry, false),
                        None => {
                            return Err(RemoteError::Config(format!(
                                "gateway '{}' for host '{}' is not defined",
                                gateway, name
                            )));
                        }
                    },
                };

                chain.push(gateway.clone());
                // Entries under `gateways` never pick up the default gateway.
                let gateway_identity =
                    self.resolve_entry(gateway, gateway_entry, !is_gateway, chain)?;
                chain.pop();
                Ok(identity.via(gateway_identity))
            }
            Some(GatewaySpec::Inline(inline)) => {
                let label = format!("{} (inline gateway)", name);
                let gateway_identity = self.resolve_entry(&label, inline, false, chain)?;
                Ok(identity.via(gateway_identity))
            }
        }
    }

    fn ssh_config(&mut self) -> Result<&SshConfig, RemoteError> {
        if self.ssh_config.is_none() {
            self.ssh_config = Some(SshConfig::load(&self.ssh_config_path)?);
        }
        self.ssh_config
            .as_ref()
            .ok_or_else(|| RemoteError::Config("ssh config unavailable".to_string()))
    }
}

fn credential_for(entry: &HostEntry) -> Credential {
    if let Some(password) = &entry.password {
        return Credential::Password(password.clone());
    }
    match &entry.key_path {
        Some(path) => Credential::KeyFile(PathBuf::from(shellexpand::tilde(path).into_owned())),
        None => Credential::Agent,
    }
}

/// Open a session for `identity`, connecting through its gateway chain.
///
/// A gateway failure is reported as `GatewayUnreachable` before any attempt
/// on the target. When the target stage fails, the gateway session is closed
/// so no half-built tunnel survives.
pub fn establish<'a>(
    connector: &'a dyn Connector,
    identity: &'a HostIdentity,
    options: &'a ConnectionOptions,
) -> BoxFuture<'a, Result<Arc<dyn RemoteSession>, RemoteError>> {
    async move {
        let Some(gateway) = identity.gateway.as_deref() else {
            return connector.connect(identity, options).await;
        };

        let gateway_session = establish(connector, gateway, options)
            .await
            .map_err(|e| {
                error!(
                    "Gateway {} unreachable for {}: {}",
                    gateway.endpoint(),
                    identity.endpoint(),
                    e
                );
                RemoteError::GatewayUnreachable {
                    gateway: gateway.description(),
                    identity: identity.description(),
                    reason: e.to_string(),
                }
            })?;

        info!(
            "Gateway {} up, connecting to {}",
            gateway.endpoint(),
            identity.endpoint()
        );

        match connector
            .connect_through(Arc::clone(&gateway_session), identity, options)
            .await
        {
            Ok(session) => Ok(session),
            Err(e) => {
                if let Err(close_err) = gateway_session.close().await {
                    warn!(
                        "Failed to close gateway {} after target failure: {}",
                        gateway.endpoint(),
                        close_err
                    );
                }
                Err(e)
            }
        }
    }
    .boxed()
}

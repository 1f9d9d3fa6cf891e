//! Static host inventory.
//!
//! The inventory is a YAML document loaded once at startup:
//!
//! ```yaml
//! defaults: { username: root, port: 22, key_filename: ~/.ssh/id_rsa }
//! gateways:
//!   bastion: { host: 203.0.113.1, username: jump }
//! hosts:
//!   amari:
//!     host: 10.0.0.5
//!     description: "LTE/5G core"
//!     paths: { logs: /root/logs }
//!     gateway: bastion
//! ```
//!
//! Every profile is resolved to a [`HostIdentity`] at load time, so a bad
//! entry anywhere fails the whole load and nothing is partially registered.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use super::error::RemoteError;
use super::gateway::GatewayResolver;
use super::identity::HostIdentity;
use super::ssh_config::default_ssh_config_path;

pub const DEFAULT_INVENTORY_FILE: &str = "hosts_config.yaml";
pub const INVENTORY_ENV_VAR: &str = "TESTBED_INVENTORY";

const NO_DESCRIPTION: &str = "No description";

/// Raw inventory document.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct InventoryFile {
    #[serde(default)]
    pub defaults: HostEntry,
    #[serde(default)]
    pub gateways: BTreeMap<String, HostEntry>,
    pub hosts: Option<BTreeMap<String, HostEntry>>,
}

/// One host as written in the inventory, before defaults are applied.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct HostEntry {
    #[serde(alias = "host")]
    pub address: Option<String>,
    #[serde(alias = "user")]
    pub username: Option<String>,
    pub port: Option<u16>,
    #[serde(alias = "key_filename")]
    pub key_path: Option<String>,
    pub password: Option<String>,
    pub gateway: Option<GatewaySpec>,
    pub ssh_alias: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub paths: BTreeMap<String, String>,
    /// Accepted only so it can be rejected with a pointer to the
    /// supported alternatives.
    pub proxy_command: Option<String>,
}

impl HostEntry {
    /// Fill unset fields from `defaults`. The defaults' gateway is skipped
    /// for entries that are gateways themselves.
    pub fn merged(&self, defaults: &HostEntry, inherit_gateway: bool) -> HostEntry {
        let mut paths = defaults.paths.clone();
        paths.extend(self.paths.clone());

        HostEntry {
            address: self.address.clone().or_else(|| defaults.address.clone()),
            username: self.username.clone().or_else(|| defaults.username.clone()),
            port: self.port.or(defaults.port),
            key_path: self.key_path.clone().or_else(|| defaults.key_path.clone()),
            password: self.password.clone().or_else(|| defaults.password.clone()),
            gateway: match &self.gateway {
                Some(gateway) => Some(gateway.clone()),
                None if inherit_gateway => defaults.gateway.clone(),
                None => None,
            },
            ssh_alias: self.ssh_alias.clone().or_else(|| defaults.ssh_alias.clone()),
            description: self.description.clone(),
            paths,
            proxy_command: self
                .proxy_command
                .clone()
                .or_else(|| defaults.proxy_command.clone()),
        }
    }
}

/// Where a host's jump host comes from.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum GatewaySpec {
    /// Name of an entry under `gateways` or `hosts`
    Named(String),
    Inline(Box<HostEntry>),
}

/// A named, fully resolved inventory entry.
#[derive(Debug, Clone, Serialize)]
pub struct HostProfile {
    pub name: String,
    pub identity: HostIdentity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Filesystem locations on the host used by deploy and collection code
    pub paths: BTreeMap<String, String>,
}

impl HostProfile {
    pub fn description(&self) -> &str {
        self.description.as_deref().unwrap_or(NO_DESCRIPTION)
    }

    pub fn path(&self, key: &str) -> Option<&str> {
        self.paths.get(key).map(String::as_str)
    }
}

/// Read-only registry of every host in the inventory.
#[derive(Debug, Clone, Default)]
pub struct HostRegistry {
    profiles: BTreeMap<String, HostProfile>,
}

impl HostRegistry {
    /// Load an inventory file, resolving ssh aliases against `~/.ssh/config`.
    pub fn load(path: &Path) -> Result<Self, RemoteError> {
        Self::load_with_ssh_config(path, &default_ssh_config_path())
    }

    pub fn load_with_ssh_config(path: &Path, ssh_config: &Path) -> Result<Self, RemoteError> {
        let contents = fs::read_to_string(path).map_err(|e| {
            RemoteError::Config(format!("failed to read inventory {}: {}", path.display(), e))
        })?;
        let registry = Self::from_yaml_with_ssh_config(&contents, ssh_config)?;
        info!(
            "Loaded {} hosts from inventory {}",
            registry.len(),
            path.display()
        );
        Ok(registry)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, RemoteError> {
        Self::from_yaml_with_ssh_config(contents, &default_ssh_config_path())
    }

    pub fn from_yaml_with_ssh_config(contents: &str, ssh_config: &Path) -> Result<Self, RemoteError> {
        let file: InventoryFile = serde_yaml::from_str(contents)
            .map_err(|e| RemoteError::Config(format!("malformed inventory: {}", e)))?;

        let hosts = file
            .hosts
            .ok_or_else(|| RemoteError::Config("inventory has no 'hosts' map".to_string()))?;

        let mut resolver = GatewayResolver::new(&file.defaults, &file.gateways, &hosts, ssh_config);

        let mut profiles = BTreeMap::new();
        for (name, entry) in &hosts {
            let identity = resolver.resolve_host(name)?;
            let merged = entry.merged(&file.defaults, true);
            profiles.insert(
                name.clone(),
                HostProfile {
                    name: name.clone(),
                    identity,
                    description: merged.description,
                    paths: merged.paths,
                },
            );
        }

        Ok(Self { profiles })
    }

    /// Look up a host by name.
    pub fn resolve(&self, name: &str) -> Result<&HostProfile, RemoteError> {
        self.profiles
            .get(name)
            .ok_or_else(|| RemoteError::UnknownHost(name.to_string()))
    }

    pub fn identity(&self, name: &str) -> Result<HostIdentity, RemoteError> {
        self.resolve(name).map(|profile| profile.identity.clone())
    }

    /// Host name to description, sorted by name.
    pub fn list_hosts(&self) -> BTreeMap<String, String> {
        self.profiles
            .iter()
            .map(|(name, profile)| (name.clone(), profile.description().to_string()))
            .collect()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }

    pub fn profiles(&self) -> impl Iterator<Item = &HostProfile> {
        self.profiles.values()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

/// Inventory path with the usual priority: explicit path, then
/// `TESTBED_INVENTORY`, then `hosts_config.yaml` in the working directory.
pub fn resolve_inventory_path(path: Option<PathBuf>) -> PathBuf {
    path.or_else(|| std::env::var(INVENTORY_ENV_VAR).ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_INVENTORY_FILE))
}

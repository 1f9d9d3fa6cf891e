//! Connection identities.
//!
//! A [`HostIdentity`] is the pooling key: two requests share a pooled session
//! iff their identities are equal in every field, including the gateway
//! chain they are tunneled through.

use std::fmt;
use std::path::PathBuf;

use serde::{Serialize, Serializer};

/// How a session authenticates.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Credential {
    /// Keys offered by the local SSH agent (SSH_AUTH_SOCK)
    Agent,
    /// Private key file, already expanded to an absolute path
    KeyFile(PathBuf),
    Password(String),
}

// Serialized as a short label so results never carry secrets.
impl Serialize for Credential {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Credential::Agent => serializer.serialize_str("agent"),
            Credential::KeyFile(path) => {
                serializer.serialize_str(&format!("key:{}", path.display()))
            }
            Credential::Password(_) => serializer.serialize_str("password"),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Agent => write!(f, "Agent"),
            Credential::KeyFile(path) => f.debug_tuple("KeyFile").field(path).finish(),
            Credential::Password(_) => write!(f, "Password(***)"),
        }
    }
}

/// Fully resolved connection target. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct HostIdentity {
    pub address: String,
    pub username: String,
    pub port: u16,
    pub credential: Credential,
    /// Jump host the target session is tunneled through
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Box<HostIdentity>>,
    /// Set when the identity was built from an OpenSSH client config alias
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_alias: Option<String>,
}

impl HostIdentity {
    pub fn new(address: impl Into<String>, username: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            username: username.into(),
            port,
            credential: Credential::Agent,
            gateway: None,
            ssh_alias: None,
        }
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = credential;
        self
    }

    pub fn via(mut self, gateway: HostIdentity) -> Self {
        self.gateway = Some(Box::new(gateway));
        self
    }

    pub fn with_ssh_alias(mut self, alias: impl Into<String>) -> Self {
        self.ssh_alias = Some(alias.into());
        self
    }

    /// `user@address:port`, without the gateway chain.
    pub fn endpoint(&self) -> String {
        format!("{}@{}:{}", self.username, self.address, self.port)
    }

    /// Human-readable description attached to results and errors.
    pub fn description(&self) -> String {
        let mut description = self.endpoint();
        if let Some(alias) = &self.ssh_alias {
            description.push_str(&format!(" [ssh alias '{}']", alias));
        }
        let mut hop = self.gateway.as_deref();
        while let Some(gateway) = hop {
            description.push_str(&format!(" via {}", gateway.endpoint()));
            hop = gateway.gateway.as_deref();
        }
        description
    }
}

impl fmt::Display for HostIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

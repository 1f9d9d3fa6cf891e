//! Authentication strategies for SSH sessions.
//!
//! A [`Credential`] from the inventory is turned into an [`AuthChain`] of
//! strategies that are tried in order until one is accepted.
//!
//! - [`PasswordAuth`]: password authentication
//! - [`KeyAuth`]: private key file (passphrase-less)
//! - [`AgentAuth`]: every identity held by the SSH agent

mod methods;

use async_trait::async_trait;
use russh::client;
use tracing::debug;

use crate::remote::identity::Credential;
use crate::remote::session::SshClientHandler;

pub use methods::{AgentAuth, KeyAuth, PasswordAuth};

/// One way of authenticating a freshly handshaken session.
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    /// * `Ok(true)` - accepted
    /// * `Ok(false)` - credentials rejected
    /// * `Err(message)` - the attempt itself failed
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, String>;

    fn name(&self) -> &'static str;
}

/// Ordered list of strategies; the first success wins.
pub struct AuthChain {
    strategies: Vec<Box<dyn AuthStrategy>>,
}

impl AuthChain {
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    /// Chain for an inventory credential. Key files fall back to the agent,
    /// which is what an interactive `ssh -i` does as well.
    pub fn for_credential(credential: &Credential) -> Self {
        match credential {
            Credential::Password(password) => Self::new().with(PasswordAuth::new(password.clone())),
            Credential::KeyFile(path) => Self::new()
                .with(KeyAuth::new(path.clone()))
                .with(AgentAuth),
            Credential::Agent => Self::new().with(AgentAuth),
        }
    }

    pub fn with(mut self, strategy: impl AuthStrategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    #[cfg(test)]
    fn names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }
}

impl Default for AuthChain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthStrategy for AuthChain {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        if self.strategies.is_empty() {
            return Err("No authentication strategies configured".to_string());
        }

        let mut last_error = None;

        for strategy in &self.strategies {
            debug!("Trying authentication strategy: {}", strategy.name());

            match strategy.authenticate(handle, username).await {
                Ok(true) => {
                    debug!("Authenticated {} with strategy {}", username, strategy.name());
                    return Ok(true);
                }
                Ok(false) => {
                    last_error = Some(format!("{} authentication rejected", strategy.name()));
                }
                Err(e) => {
                    debug!("Strategy {} errored: {}", strategy.name(), e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| "All authentication methods failed".to_string()))
    }

    fn name(&self) -> &'static str {
        "chain"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_password_credential_builds_single_strategy() {
        let chain = AuthChain::for_credential(&Credential::Password("secret".into()));
        assert_eq!(chain.names(), vec!["password"]);
    }

    #[test]
    fn test_key_credential_falls_back_to_agent() {
        let chain =
            AuthChain::for_credential(&Credential::KeyFile(PathBuf::from("/root/.ssh/id_rsa")));
        assert_eq!(chain.names(), vec!["key", "agent"]);
    }

    #[test]
    fn test_agent_credential() {
        let chain = AuthChain::for_credential(&Credential::Agent);
        assert_eq!(chain.names(), vec!["agent"]);
    }

    #[test]
    fn test_empty_chain() {
        let chain = AuthChain::default();
        assert!(chain.is_empty());
        assert_eq!(chain.name(), "chain");
    }

    #[test]
    fn test_chain_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AuthChain>();
    }
}

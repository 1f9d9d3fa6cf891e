use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use russh::{client, keys};
use tracing::debug;

use crate::remote::session::SshClientHandler;

use super::AuthStrategy;

/// Best RSA hash the server supports; `None` for non-RSA servers.
async fn rsa_hash(handle: &client::Handle<SshClientHandler>) -> Option<keys::HashAlg> {
    handle
        .best_supported_rsa_hash()
        .await
        .ok()
        .flatten()
        .flatten()
}

pub struct PasswordAuth {
    password: String,
}

impl PasswordAuth {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }
}

#[async_trait]
impl AuthStrategy for PasswordAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        let result = handle
            .authenticate_password(username, &self.password)
            .await
            .map_err(|e| format!("Password authentication failed: {}", e))?;

        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "password"
    }
}

/// Public key authentication from a key file on the controller.
pub struct KeyAuth {
    key_path: PathBuf,
}

impl KeyAuth {
    pub fn new(key_path: impl Into<PathBuf>) -> Self {
        Self {
            key_path: key_path.into(),
        }
    }
}

#[async_trait]
impl AuthStrategy for KeyAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        let key_pair = keys::load_secret_key(&self.key_path, None)
            .map_err(|e| format!("Failed to load private key from {:?}: {}", self.key_path, e))?;

        let hash_alg = rsa_hash(handle).await;
        let key = keys::PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg);

        let result = handle
            .authenticate_publickey(username, key)
            .await
            .map_err(|e| format!("Key authentication failed: {}", e))?;

        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "key"
    }
}

/// Tries each identity offered by the agent behind `SSH_AUTH_SOCK`.
pub struct AgentAuth;

#[async_trait]
impl AuthStrategy for AgentAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        let mut agent = keys::agent::client::AgentClient::connect_env()
            .await
            .map_err(|e| format!("Failed to connect to SSH agent: {}", e))?;

        let identities = agent
            .request_identities()
            .await
            .map_err(|e| format!("Failed to list SSH agent identities: {}", e))?;

        if identities.is_empty() {
            return Err("No identities found in SSH agent".to_string());
        }

        let hash_alg = rsa_hash(handle).await;
        for identity in identities {
            debug!("Offering agent identity {:?}", identity.comment());

            match handle
                .authenticate_publickey_with(username, identity.clone(), hash_alg, &mut agent)
                .await
            {
                Ok(result) if result.success() => return Ok(true),
                Ok(_) => continue,
                Err(e) => {
                    debug!("Agent identity failed: {}", e);
                    continue;
                }
            }
        }

        Ok(false)
    }

    fn name(&self) -> &'static str {
        "agent"
    }
}

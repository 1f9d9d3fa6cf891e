//! OpenSSH client config lookup for hosts that are only reachable through a
//! pre-configured alias.
//!
//! Only the directives that shape a connection identity are read:
//! `HostName`, `User`, `Port`, `IdentityFile` and `ProxyJump`. As in
//! OpenSSH, the first value obtained for a directive wins, and `Host`
//! patterns support `*`, `?` and `!` negation. `Match` blocks never match.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::error::RemoteError;
use super::identity::{Credential, HostIdentity};

/// ProxyJump chains deeper than this are treated as a loop.
const MAX_JUMP_DEPTH: usize = 8;

/// Default location of the user's client config.
pub fn default_ssh_config_path() -> PathBuf {
    PathBuf::from(shellexpand::tilde("~/.ssh/config").into_owned())
}

/// One `[user@]host[:port]` hop of a `ProxyJump` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JumpHost {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

impl JumpHost {
    fn parse(spec: &str) -> Result<Self, RemoteError> {
        let (user, rest) = match spec.rsplit_once('@') {
            Some((user, rest)) => (Some(user.to_string()), rest),
            None => (None, spec),
        };

        // Bracketed IPv6: [::1]:2222
        let (host, port) = if let Some(stripped) = rest.strip_prefix('[') {
            match stripped.split_once(']') {
                Some((host, tail)) => (host, tail.strip_prefix(':')),
                None => return Err(invalid_jump(spec)),
            }
        } else {
            match rest.rsplit_once(':') {
                Some((host, port)) if !host.contains(':') => (host, Some(port)),
                _ => (rest, None),
            }
        };

        if host.is_empty() {
            return Err(invalid_jump(spec));
        }

        let port = port
            .map(|p| p.parse::<u16>().map_err(|_| invalid_jump(spec)))
            .transpose()?;

        Ok(Self {
            user,
            host: host.to_string(),
            port,
        })
    }
}

fn invalid_jump(spec: &str) -> RemoteError {
    RemoteError::Config(format!("invalid ProxyJump host '{}'", spec))
}

/// Effective settings for one alias.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SshHostConfig {
    pub hostname: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity_file: Option<PathBuf>,
    /// Outermost hop first, as written in the config
    pub proxy_jump: Vec<JumpHost>,
}

#[derive(Debug, Clone)]
struct Block {
    patterns: Vec<String>,
    options: Vec<(String, String)>,
}

impl Block {
    fn matches(&self, alias: &str) -> bool {
        let mut matched = false;
        for pattern in &self.patterns {
            if let Some(negated) = pattern.strip_prefix('!') {
                if glob_match(negated, alias) {
                    return false;
                }
            } else if glob_match(pattern, alias) {
                matched = true;
            }
        }
        matched
    }

    /// Whether this block names the alias more specifically than `Host *`.
    fn defines(&self, alias: &str) -> bool {
        self.matches(alias)
            && self
                .patterns
                .iter()
                .any(|p| p != "*" && !p.starts_with('!') && glob_match(p, alias))
    }
}

/// A parsed client config file.
#[derive(Debug, Clone, Default)]
pub struct SshConfig {
    blocks: Vec<Block>,
}

impl SshConfig {
    /// Read and parse `path`. A missing file is an empty config, which makes
    /// every alias lookup fail with a configuration error.
    pub fn load(path: &Path) -> Result<Self, RemoteError> {
        match fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No ssh client config at {}", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(RemoteError::Config(format!(
                "failed to read ssh config {}: {}",
                path.display(),
                e
            ))),
        }
    }

    pub fn parse(contents: &str) -> Result<Self, RemoteError> {
        // Directives before the first Host line apply to every host.
        let mut blocks = vec![Block {
            patterns: vec!["*".to_string()],
            options: Vec::new(),
        }];

        for (index, raw) in contents.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((keyword, value)) = split_directive(line) else {
                return Err(RemoteError::Config(format!(
                    "ssh config line {}: missing value in '{}'",
                    index + 1,
                    line
                )));
            };

            match keyword.as_str() {
                "host" => blocks.push(Block {
                    patterns: value.split_whitespace().map(unquote).collect(),
                    options: Vec::new(),
                }),
                "match" => blocks.push(Block {
                    patterns: Vec::new(),
                    options: Vec::new(),
                }),
                "include" => debug!("Ignoring ssh config Include {}", value),
                _ => {
                    if let Some(block) = blocks.last_mut() {
                        block.options.push((keyword, unquote(value)));
                    }
                }
            }
        }

        Ok(Self { blocks })
    }

    /// Effective settings for `alias`, `None` when no block names it.
    pub fn lookup(&self, alias: &str) -> Result<Option<SshHostConfig>, RemoteError> {
        if !self.blocks.iter().any(|b| b.defines(alias)) {
            return Ok(None);
        }

        let mut config = SshHostConfig::default();
        let mut jump_seen = false;

        for block in self.blocks.iter().filter(|b| b.matches(alias)) {
            for (keyword, value) in &block.options {
                match keyword.as_str() {
                    "hostname" if config.hostname.is_none() => {
                        config.hostname = Some(value.replace("%h", alias));
                    }
                    "user" if config.user.is_none() => config.user = Some(value.clone()),
                    "port" if config.port.is_none() => {
                        let port = value.parse::<u16>().map_err(|_| {
                            RemoteError::Config(format!(
                                "invalid Port '{}' for ssh alias '{}'",
                                value, alias
                            ))
                        })?;
                        config.port = Some(port);
                    }
                    "identityfile" if config.identity_file.is_none() => {
                        config.identity_file =
                            Some(PathBuf::from(shellexpand::tilde(value).into_owned()));
                    }
                    "proxyjump" if !jump_seen => {
                        jump_seen = true;
                        if !value.eq_ignore_ascii_case("none") {
                            config.proxy_jump = value
                                .split(',')
                                .map(|hop| JumpHost::parse(hop.trim()))
                                .collect::<Result<_, _>>()?;
                        }
                    }
                    _ => {}
                }
            }
        }

        Ok(Some(config))
    }

    /// Build the identity OpenSSH would use for `alias`.
    ///
    /// Values the config leaves unset come from `fallback`. The returned
    /// identity carries `ssh_alias`, and any `ProxyJump` chain becomes its
    /// gateway chain.
    pub fn identity_for(
        &self,
        alias: &str,
        fallback: &HostIdentity,
    ) -> Result<HostIdentity, RemoteError> {
        let config = self.lookup(alias)?.ok_or_else(|| {
            RemoteError::Config(format!("ssh alias '{}' not found in ssh config", alias))
        })?;

        let mut identity = self.apply(alias, &config, fallback).with_ssh_alias(alias);

        let mut gateway: Option<HostIdentity> = None;
        for hop in &config.proxy_jump {
            let mut hop_identity = self.jump_identity(hop, fallback, 1)?;
            if let Some(outer) = gateway.take() {
                hop_identity = hop_identity.via(outer);
            }
            gateway = Some(hop_identity);
        }
        if let Some(gateway) = gateway {
            identity = identity.via(gateway);
        }

        Ok(identity)
    }

    fn apply(&self, alias: &str, config: &SshHostConfig, fallback: &HostIdentity) -> HostIdentity {
        let address = config.hostname.clone().unwrap_or_else(|| alias.to_string());
        let username = config
            .user
            .clone()
            .unwrap_or_else(|| fallback.username.clone());
        let port = config.port.unwrap_or(fallback.port);
        let credential = match &config.identity_file {
            Some(path) => Credential::KeyFile(path.clone()),
            None => fallback.credential.clone(),
        };

        HostIdentity::new(address, username, port).with_credential(credential)
    }

    /// Identity for one jump hop. A hop that is itself an alias picks up
    /// that alias's settings and its own ProxyJump chain.
    fn jump_identity(
        &self,
        hop: &JumpHost,
        fallback: &HostIdentity,
        depth: usize,
    ) -> Result<HostIdentity, RemoteError> {
        if depth > MAX_JUMP_DEPTH {
            return Err(RemoteError::Config(format!(
                "ProxyJump chain through '{}' is too deep",
                hop.host
            )));
        }

        let (mut identity, chain) = match self.lookup(&hop.host)? {
            Some(config) => (self.apply(&hop.host, &config, fallback), config.proxy_jump),
            None => (
                HostIdentity::new(hop.host.clone(), fallback.username.clone(), 22)
                    .with_credential(fallback.credential.clone()),
                Vec::new(),
            ),
        };

        if let Some(user) = &hop.user {
            identity.username = user.clone();
        }
        if let Some(port) = hop.port {
            identity.port = port;
        }

        let mut gateway: Option<HostIdentity> = None;
        for inner in &chain {
            let mut inner_identity = self.jump_identity(inner, fallback, depth + 1)?;
            if let Some(outer) = gateway.take() {
                inner_identity = inner_identity.via(outer);
            }
            gateway = Some(inner_identity);
        }

        Ok(match gateway {
            Some(gateway) => identity.via(gateway),
            None => identity,
        })
    }
}

/// Split `Keyword value` or `Keyword=value`, lowercasing the keyword.
fn split_directive(line: &str) -> Option<(String, &str)> {
    let split_at = line.find(|c: char| c.is_whitespace() || c == '=')?;
    let (keyword, rest) = line.split_at(split_at);
    let value = rest
        .trim_start()
        .strip_prefix('=')
        .unwrap_or(rest)
        .trim();
    if value.is_empty() {
        return None;
    }
    Some((keyword.to_ascii_lowercase(), value))
}

fn unquote(value: &str) -> String {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
        .to_string()
}

/// `*` and `?` wildcard match over bytes.
fn glob_match(pattern: &str, text: &str) -> bool {
    fn inner(p: &[u8], t: &[u8]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&p[1..], t) || (!t.is_empty() && inner(p, &t[1..])),
            (Some(b'?'), Some(_)) => inner(&p[1..], &t[1..]),
            (Some(a), Some(b)) if a == b => inner(&p[1..], &t[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}

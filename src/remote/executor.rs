//! Host-name level facade.
//!
//! Workflow code (deploys, log collection, probes) talks to hosts by
//! inventory name. `HostExecutor` owns the registry and one pool for the
//! process lifetime and turns names into identities before handing requests
//! to the [`CommandRunner`].

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{error, info};

use super::client::RusshConnector;
use super::config::ConnectionOptions;
use super::error::RemoteError;
use super::inventory::HostRegistry;
use super::pool::{ConnectionPool, PoolStats};
use super::runner::CommandRunner;
use super::transport::Connector;
use super::types::{ExecutionMode, ExecutionRequest, ExecutionResult};

const PROBE_COMMAND: &str = "echo 'Connection test successful'";

pub struct HostExecutor {
    registry: HostRegistry,
    runner: CommandRunner,
}

impl HostExecutor {
    pub fn new(
        registry: HostRegistry,
        connector: Arc<dyn Connector>,
        options: ConnectionOptions,
    ) -> Self {
        let pool = Arc::new(ConnectionPool::new(connector, options));
        Self {
            registry,
            runner: CommandRunner::new(pool),
        }
    }

    /// Executor speaking real SSH.
    pub fn connect(registry: HostRegistry, options: ConnectionOptions) -> Self {
        Self::new(registry, Arc::new(RusshConnector), options)
    }

    pub fn registry(&self) -> &HostRegistry {
        &self.registry
    }

    pub fn runner(&self) -> &CommandRunner {
        &self.runner
    }

    /// Run `command` on the host named `host`.
    ///
    /// `session_name` only applies to detached runs.
    pub async fn execute(
        &self,
        host: &str,
        command: &str,
        mode: ExecutionMode,
        session_name: Option<String>,
    ) -> Result<ExecutionResult, RemoteError> {
        let identity = self.registry.identity(host)?;
        let request = match mode {
            ExecutionMode::Sync => ExecutionRequest::sync(identity, command),
            ExecutionMode::Detached => ExecutionRequest::detached(identity, command, session_name),
        };
        self.runner.run(&request).await
    }

    /// Run `command` on every host not in `exclude`, concurrently.
    ///
    /// A host that cannot be reached gets a failed result carrying the error
    /// text; it never aborts the others.
    pub async fn execute_on_all_hosts(
        &self,
        command: &str,
        mode: ExecutionMode,
        exclude: &[&str],
    ) -> BTreeMap<String, ExecutionResult> {
        let hosts: Vec<&str> = self
            .registry
            .names()
            .filter(|name| !exclude.contains(name))
            .collect();

        info!("Running on {} hosts: {}", hosts.len(), command);

        let results = join_all(hosts.iter().map(|host| async move {
            let result = match self.execute(host, command, mode, None).await {
                Ok(result) => result,
                Err(e) => {
                    error!("Execution on {} failed: {}", host, e);
                    let identity = self
                        .registry
                        .resolve(host)
                        .map(|profile| profile.identity.description())
                        .unwrap_or_else(|_| host.to_string());
                    ExecutionResult::from_error(mode, identity, &e)
                }
            };
            (host.to_string(), result)
        }))
        .await;

        results.into_iter().collect()
    }

    /// Probe every host with an `echo` and report which answered.
    pub async fn test_connections(&self) -> BTreeMap<String, bool> {
        self.execute_on_all_hosts(PROBE_COMMAND, ExecutionMode::Sync, &[])
            .await
            .into_iter()
            .map(|(host, result)| (host, result.success))
            .collect()
    }

    pub async fn stop_session(
        &self,
        host: &str,
        session_name: &str,
        kill_pattern: Option<&str>,
        sudo: bool,
    ) -> Result<ExecutionResult, RemoteError> {
        let identity = self.registry.identity(host)?;
        self.runner
            .stop(&identity, session_name, kill_pattern, sudo)
            .await
    }

    pub async fn session_running(&self, host: &str, session_name: &str) -> Result<bool, RemoteError> {
        let identity = self.registry.identity(host)?;
        self.runner.session_running(&identity, session_name).await
    }

    pub async fn process_running(&self, host: &str, pattern: &str) -> Result<bool, RemoteError> {
        let identity = self.registry.identity(host)?;
        self.runner.process_running(&identity, pattern).await
    }

    pub fn pool_stats(&self) -> Vec<PoolStats> {
        self.runner.pool().stats()
    }

    /// Close every pooled session.
    pub async fn shutdown(&self) {
        self.runner.pool().shutdown().await;
    }
}

//! Command execution over pooled sessions.
//!
//! ## Synchronous runs
//!
//! Acquire, dispatch, wait up to the command timeout, report exit code and
//! both streams. A non-zero exit is a normal result with `success = false`.
//! Only connectivity failures come back as `Err`, after the pool entry has
//! been discarded.
//!
//! ## Detached runs
//!
//! The command is started inside a named tmux session, which outlives the
//! SSH channel. The wrapper's own exit status decides `success`. A second,
//! best-effort round trip asks tmux for the pane PID; when that fails the
//! result stays successful with `remote_pid = None`.
//!
//! Both steps of a detached run happen under one checkout of the identity
//! lock. Running the same session name twice is not deduplicated; the second
//! spawn fails because tmux refuses duplicate names.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::error::RemoteError;
use super::identity::HostIdentity;
use super::pool::{ConnectionPool, PooledSession};
use super::tmux::{self, TmuxCommands};
use super::types::{CommandOutput, ExecutionMode, ExecutionRequest, ExecutionResult};

pub struct CommandRunner {
    pool: Arc<ConnectionPool>,
    tmux: TmuxCommands,
}

impl CommandRunner {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self {
            pool,
            tmux: TmuxCommands,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub async fn run(&self, request: &ExecutionRequest) -> Result<ExecutionResult, RemoteError> {
        match request.mode {
            ExecutionMode::Sync => self.run_sync(request).await,
            ExecutionMode::Detached => self.run_detached(request).await,
        }
    }

    async fn run_sync(&self, request: &ExecutionRequest) -> Result<ExecutionResult, RemoteError> {
        let timeout = request
            .timeout
            .unwrap_or(self.pool.options().command_timeout);

        let pooled = self.pool.acquire(&request.identity).await?;
        debug!("Running on {}: {}", request.identity, request.command);
        let output = self
            .dispatch(&pooled, &request.identity, &request.command, timeout)
            .await?;

        let timed_out = output.timed_out;
        let mut result = ExecutionResult::from_output(
            ExecutionMode::Sync,
            &request.identity,
            output,
            pooled.reused(),
        );
        if timed_out {
            warn!(
                "Command on {} timed out after {:?}",
                request.identity, timeout
            );
            result.timed_out_after = Some(timeout);
        }
        Ok(result)
    }

    async fn run_detached(
        &self,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult, RemoteError> {
        let session_name = match &request.session_name {
            Some(name) => {
                tmux::validate_session_name(name)?;
                name.clone()
            }
            None => tmux::generate_session_name(),
        };
        let options = self.pool.options();
        let spawn_timeout = request.timeout.unwrap_or(options.spawn_timeout);

        let pooled = self.pool.acquire(&request.identity).await?;
        let spawn = self.tmux.new_session(&session_name, &request.command);
        let output = self
            .dispatch(&pooled, &request.identity, &spawn, spawn_timeout)
            .await?;

        let mut result = ExecutionResult::from_output(
            ExecutionMode::Detached,
            &request.identity,
            output,
            pooled.reused(),
        );
        result.session_name = Some(session_name.clone());
        if result.timed_out {
            result.timed_out_after = Some(spawn_timeout);
        }

        if !result.success {
            warn!(
                "Failed to start tmux session '{}' on {}: {}",
                session_name,
                request.identity,
                result.stderr.trim()
            );
            return Ok(result);
        }

        result.remote_pid = self
            .lookup_pid(&pooled, &request.identity, &session_name, options.pid_lookup_timeout)
            .await;

        info!(
            "Started tmux session '{}' on {} (pid {:?})",
            session_name, request.identity, result.remote_pid
        );
        Ok(result)
    }

    /// PID of the session's leading pane. Any failure is logged and yields `None`.
    async fn lookup_pid(
        &self,
        pooled: &PooledSession,
        identity: &HostIdentity,
        session_name: &str,
        timeout: Duration,
    ) -> Option<u32> {
        let command = self.tmux.pane_pid(session_name);
        match self.dispatch(pooled, identity, &command, timeout).await {
            Ok(output) if output.success() => {
                let pid = tmux::parse_pid(&output.stdout);
                if pid.is_none() {
                    debug!(
                        "No PID in list-panes output for '{}' on {}: {:?}",
                        session_name, identity, output.stdout
                    );
                }
                pid
            }
            Ok(output) => {
                debug!(
                    "PID lookup for '{}' on {} exited with {:?}: {}",
                    session_name,
                    identity,
                    output.exit_code,
                    output.stderr.trim()
                );
                None
            }
            Err(e) => {
                debug!("PID lookup for '{}' on {} failed: {}", session_name, identity, e);
                None
            }
        }
    }

    /// Kill a detached session and optionally every process matching
    /// `kill_pattern`. Succeeds whether or not anything was running.
    pub async fn stop(
        &self,
        identity: &HostIdentity,
        session_name: &str,
        kill_pattern: Option<&str>,
        sudo: bool,
    ) -> Result<ExecutionResult, RemoteError> {
        let command = self.tmux.stop(session_name, kill_pattern, sudo);
        info!("Stopping tmux session '{}' on {}", session_name, identity);
        let mut result = self.run(&ExecutionRequest::sync(identity.clone(), command)).await?;
        result.session_name = Some(session_name.to_string());
        Ok(result)
    }

    /// Whether tmux on the host lists a session named exactly `session_name`.
    pub async fn session_running(
        &self,
        identity: &HostIdentity,
        session_name: &str,
    ) -> Result<bool, RemoteError> {
        let request = ExecutionRequest::sync(identity.clone(), self.tmux.list_sessions());
        let result = self.run(&request).await?;
        Ok(tmux::session_listed(&result.stdout, session_name))
    }

    /// Whether any process command line on the host matches `pattern`.
    pub async fn process_running(
        &self,
        identity: &HostIdentity,
        pattern: &str,
    ) -> Result<bool, RemoteError> {
        let request = ExecutionRequest::sync(identity.clone(), self.tmux.process_check(pattern));
        Ok(self.run(&request).await?.success)
    }

    /// Run one command on a checked-out session. A connectivity failure
    /// evicts the session so the next acquire reconnects.
    async fn dispatch(
        &self,
        pooled: &PooledSession,
        identity: &HostIdentity,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, RemoteError> {
        match pooled.exec(command, timeout).await {
            Ok(output) => Ok(output),
            Err(e) => {
                if e.is_connectivity() {
                    warn!("Session to {} failed mid-command: {}", identity, e);
                    self.pool.discard(identity).await;
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::config::ConnectionOptions;
    use crate::remote::error::Stage;
    use crate::remote::mock::MockConnector;

    fn runner_with(connector: &MockConnector) -> CommandRunner {
        runner_with_options(connector, ConnectionOptions::default())
    }

    fn runner_with_options(connector: &MockConnector, options: ConnectionOptions) -> CommandRunner {
        let pool = ConnectionPool::new(Arc::new(connector.clone()), options);
        CommandRunner::new(Arc::new(pool))
    }

    fn amari() -> HostIdentity {
        HostIdentity::new("10.0.0.5", "root", 22)
    }

    mod sync {
        use super::*;

        #[tokio::test]
        async fn test_success_and_reuse() {
            let connector = MockConnector::new();
            connector.respond("uname", CommandOutput::exited(0, "Linux", ""));
            let runner = runner_with(&connector);

            let first = runner
                .run(&ExecutionRequest::sync(amari(), "uname -s"))
                .await
                .unwrap();
            assert!(first.success);
            assert_eq!(first.stdout, "Linux");
            assert!(!first.reused_session);

            let second = runner
                .run(&ExecutionRequest::sync(amari(), "uname -s"))
                .await
                .unwrap();
            assert!(second.reused_session);
            assert_eq!(connector.connect_count(&amari()), 1);
        }

        #[tokio::test]
        async fn test_nonzero_exit_is_a_result() {
            let connector = MockConnector::new();
            connector.respond("cat", CommandOutput::exited(1, "", "No such file"));
            let runner = runner_with(&connector);

            let result = runner
                .run(&ExecutionRequest::sync(amari(), "cat /missing"))
                .await
                .unwrap();
            assert!(!result.success);
            assert_eq!(result.exit_code, Some(1));
            assert_eq!(result.stderr, "No such file");
        }

        #[tokio::test]
        async fn test_transport_failure_evicts_session() {
            let connector = MockConnector::new();
            connector.drop_on("reboot", "Connection reset by peer");
            let runner = runner_with(&connector);

            let err = runner
                .run(&ExecutionRequest::sync(amari(), "reboot"))
                .await
                .err()
                .unwrap();
            assert!(err.is_connectivity());
            assert!(runner.pool().is_empty());

            runner
                .run(&ExecutionRequest::sync(amari(), "uptime"))
                .await
                .unwrap();
            assert_eq!(connector.connect_count(&amari()), 2);
        }

        #[tokio::test]
        async fn test_command_timeout_returns_partial_result() {
            let connector = MockConnector::new();
            connector.set_exec_delay(Duration::from_millis(500));
            let options =
                ConnectionOptions::default().with_command_timeout(Duration::from_millis(20));
            let runner = runner_with_options(&connector, options);

            let result = runner
                .run(&ExecutionRequest::sync(amari(), "sleep 600"))
                .await
                .unwrap();
            assert!(result.timed_out);
            assert!(!result.success);
            assert_eq!(result.exit_code, None);
            assert_eq!(result.timed_out_after, Some(Duration::from_millis(20)));
            // A slow command is not a dead session.
            assert_eq!(runner.pool().len(), 1);

            match result.ensure_success() {
                Err(RemoteError::Timeout { stage, after, .. }) => {
                    assert_eq!(stage, Stage::Command);
                    assert_eq!(after, Duration::from_millis(20));
                }
                other => panic!("unexpected: {:?}", other),
            }
        }

        #[tokio::test]
        async fn test_request_timeout_overrides_configured_one() {
            let connector = MockConnector::new();
            connector.set_exec_delay(Duration::from_millis(50));
            let options =
                ConnectionOptions::default().with_command_timeout(Duration::from_millis(10));
            let runner = runner_with_options(&connector, options);

            let patient = runner
                .run(&ExecutionRequest::sync(amari(), "make").with_timeout(Duration::from_secs(5)))
                .await
                .unwrap();
            assert!(patient.success);
            assert!(!patient.timed_out);

            let default = runner
                .run(&ExecutionRequest::sync(amari(), "make"))
                .await
                .unwrap();
            assert!(default.timed_out);
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn test_commands_on_one_identity_never_interleave() {
            let connector = MockConnector::new();
            connector.set_exec_delay(Duration::from_millis(5));
            let runner = Arc::new(runner_with(&connector));

            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let runner = Arc::clone(&runner);
                    tokio::spawn(async move {
                        runner
                            .run(&ExecutionRequest::sync(amari(), format!("echo {}", i)))
                            .await
                            .unwrap();
                    })
                })
                .collect();
            for handle in handles {
                handle.await.unwrap();
            }

            let log = connector.dispatch_log();
            assert_eq!(log.len(), 16);
            for pair in log.chunks(2) {
                let command = pair[0].strip_prefix("start:").unwrap();
                assert_eq!(pair[1], format!("end:{}", command));
            }
            assert_eq!(connector.connect_count(&amari()), 1);
        }
    }

    mod detached {
        use super::*;

        #[tokio::test]
        async fn test_spawn_failure_has_no_pid() {
            let connector = MockConnector::new();
            connector.respond(
                "new-session",
                CommandOutput::exited(1, "", "duplicate session: probe1"),
            );
            let runner = runner_with(&connector);

            let result = runner
                .run(&ExecutionRequest::detached(
                    amari(),
                    "./probe",
                    Some("probe1".into()),
                ))
                .await
                .unwrap();

            assert!(!result.success);
            assert_eq!(result.remote_pid, None);
            assert_eq!(result.session_name.as_deref(), Some("probe1"));
            assert!(
                !connector
                    .commands_for(&amari())
                    .iter()
                    .any(|c| c.contains("list-panes"))
            );
        }

        #[tokio::test]
        async fn test_pid_lookup_failure_keeps_success() {
            let connector = MockConnector::new();
            connector.respond("list-panes", CommandOutput::exited(1, "", "no server running"));
            let runner = runner_with(&connector);

            let result = runner
                .run(&ExecutionRequest::detached(
                    amari(),
                    "./probe",
                    Some("probe1".into()),
                ))
                .await
                .unwrap();

            assert!(result.success);
            assert_eq!(result.remote_pid, None);
            assert_eq!(result.session_name.as_deref(), Some("probe1"));
        }

        #[tokio::test]
        async fn test_pid_lookup_transport_failure_is_swallowed() {
            let connector = MockConnector::new();
            connector.drop_on("list-panes", "Connection reset by peer");
            let runner = runner_with(&connector);

            let result = runner
                .run(&ExecutionRequest::detached(amari(), "./probe", None))
                .await
                .unwrap();

            assert!(result.success);
            assert_eq!(result.remote_pid, None);
        }

        #[tokio::test]
        async fn test_pid_found() {
            let connector = MockConnector::new();
            connector.respond("list-panes", CommandOutput::exited(0, "4242", ""));
            let runner = runner_with(&connector);

            let result = runner
                .run(&ExecutionRequest::detached(
                    amari(),
                    "./probe",
                    Some("probe1".into()),
                ))
                .await
                .unwrap();

            assert!(result.success);
            assert_eq!(result.remote_pid, Some(4242));
            assert_eq!(connector.commands_for(&amari())[0], "tmux new-session -d -s probe1 ./probe");
        }

        #[tokio::test]
        async fn test_derived_session_name() {
            let connector = MockConnector::new();
            let runner = runner_with(&connector);

            let result = runner
                .run(&ExecutionRequest::detached(amari(), "sleep 600", None))
                .await
                .unwrap();

            let name = result.session_name.unwrap();
            assert!(name.starts_with("bg_"));
            assert!(connector.commands_for(&amari())[0].contains(&name));
        }

        #[tokio::test]
        async fn test_invalid_session_name_never_connects() {
            let connector = MockConnector::new();
            let runner = runner_with(&connector);

            let err = runner
                .run(&ExecutionRequest::detached(
                    amari(),
                    "./probe",
                    Some("bad.name".into()),
                ))
                .await
                .err()
                .unwrap();
            assert!(err.is_fatal());
            assert_eq!(connector.total_connects(), 0);
        }
    }

    mod helpers {
        use super::*;

        #[tokio::test]
        async fn test_stop_missing_session_succeeds() {
            let connector = MockConnector::new();
            let runner = runner_with(&connector);

            let result = runner
                .stop(&amari(), "no_such_session", Some("main.py"), true)
                .await
                .unwrap();
            assert!(result.success);
            assert_eq!(result.session_name.as_deref(), Some("no_such_session"));

            let sent = &connector.commands_for(&amari())[0];
            assert!(sent.starts_with("tmux kill-session -t =no_such_session"));
            assert!(sent.ends_with("|| true"));
        }

        #[tokio::test]
        async fn test_session_running_matches_exact_name() {
            let connector = MockConnector::new();
            connector.respond(
                "list-sessions",
                CommandOutput::exited(0, "file_server\nfile_server_pmec", ""),
            );
            let runner = runner_with(&connector);

            assert!(runner.session_running(&amari(), "file_server").await.unwrap());
            assert!(!runner.session_running(&amari(), "file").await.unwrap());
        }

        #[tokio::test]
        async fn test_process_running() {
            let connector = MockConnector::new();
            connector.respond("pgrep", CommandOutput::exited(1, "", ""));
            let runner = runner_with(&connector);

            assert!(!runner.process_running(&amari(), "transcoder").await.unwrap());
        }
    }
}

//! In-memory transport for tests.
//!
//! `MockConnector` counts connects per identity, can be told to fail them,
//! and hands out `MockSession`s whose liveness can be switched off. Sessions
//! answer commands from scripted rules and record every dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::config::ConnectionOptions;
use super::error::RemoteError;
use super::identity::HostIdentity;
use super::transport::{Connector, RemoteSession, TunnelStream};
use super::types::CommandOutput;

#[derive(Clone)]
enum Reply {
    Output(CommandOutput),
    /// Transport failure mid-command
    Drop(String),
}

#[derive(Default)]
struct MockState {
    connects: Mutex<HashMap<HostIdentity, usize>>,
    closed: Mutex<HashMap<HostIdentity, usize>>,
    failures: Mutex<HashMap<HostIdentity, String>>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
    rules: Mutex<Vec<(String, Reply)>>,
    commands: Mutex<Vec<(HostIdentity, String)>>,
    dispatch_log: Mutex<Vec<String>>,
    tunnels: AtomicUsize,
    exec_delay: Mutex<Option<Duration>>,
    fail_close: AtomicBool,
}

#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<MockState>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects to `identity` fail with a connection error until cleared.
    pub fn fail_connect(&self, identity: &HostIdentity, reason: &str) {
        self.state
            .failures
            .lock()
            .unwrap()
            .insert(identity.clone(), reason.to_string());
    }

    pub fn clear_failure(&self, identity: &HostIdentity) {
        self.state.failures.lock().unwrap().remove(identity);
    }

    /// Commands containing `pattern` produce `output`. First match wins.
    pub fn respond(&self, pattern: &str, output: CommandOutput) {
        self.state
            .rules
            .lock()
            .unwrap()
            .push((pattern.to_string(), Reply::Output(output)));
    }

    /// Commands containing `pattern` fail as if the session died.
    pub fn drop_on(&self, pattern: &str, reason: &str) {
        self.state
            .rules
            .lock()
            .unwrap()
            .push((pattern.to_string(), Reply::Drop(reason.to_string())));
    }

    pub fn set_exec_delay(&self, delay: Duration) {
        *self.state.exec_delay.lock().unwrap() = Some(delay);
    }

    /// Every later `close` records the attempt, then returns an error.
    pub fn fail_close(&self) {
        self.state.fail_close.store(true, Ordering::SeqCst);
    }

    /// Mark every open session for `identity` dead.
    pub fn kill(&self, identity: &HostIdentity) {
        for session in self.state.sessions.lock().unwrap().iter() {
            if &session.identity == identity {
                session.alive.store(false, Ordering::SeqCst);
            }
        }
    }

    pub fn connect_count(&self, identity: &HostIdentity) -> usize {
        self.state
            .connects
            .lock()
            .unwrap()
            .get(identity)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_connects(&self) -> usize {
        self.state.connects.lock().unwrap().values().sum()
    }

    pub fn closed_count(&self, identity: &HostIdentity) -> usize {
        self.state
            .closed
            .lock()
            .unwrap()
            .get(identity)
            .copied()
            .unwrap_or(0)
    }

    pub fn tunnel_count(&self) -> usize {
        self.state.tunnels.load(Ordering::SeqCst)
    }

    /// Commands dispatched to `identity`, in order.
    pub fn commands_for(&self, identity: &HostIdentity) -> Vec<String> {
        self.state
            .commands
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == identity)
            .map(|(_, command)| command.clone())
            .collect()
    }

    /// `start:<cmd>` / `end:<cmd>` events across all sessions.
    pub fn dispatch_log(&self) -> Vec<String> {
        self.state.dispatch_log.lock().unwrap().clone()
    }

    fn open(&self, identity: &HostIdentity) -> Result<Arc<dyn RemoteSession>, RemoteError> {
        *self
            .state
            .connects
            .lock()
            .unwrap()
            .entry(identity.clone())
            .or_default() += 1;

        if let Some(reason) = self.state.failures.lock().unwrap().get(identity) {
            return Err(RemoteError::connection(identity.description(), reason.clone()));
        }

        let session = Arc::new(MockSession {
            identity: identity.clone(),
            alive: AtomicBool::new(true),
            state: Arc::clone(&self.state),
        });
        self.state
            .sessions
            .lock()
            .unwrap()
            .push(Arc::clone(&session));
        Ok(session)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        identity: &HostIdentity,
        _options: &ConnectionOptions,
    ) -> Result<Arc<dyn RemoteSession>, RemoteError> {
        self.open(identity)
    }

    async fn connect_through(
        &self,
        gateway: Arc<dyn RemoteSession>,
        identity: &HostIdentity,
        _options: &ConnectionOptions,
    ) -> Result<Arc<dyn RemoteSession>, RemoteError> {
        gateway.open_tunnel(&identity.address, identity.port).await?;
        self.open(identity)
    }
}

pub struct MockSession {
    identity: HostIdentity,
    alive: AtomicBool,
    state: Arc<MockState>,
}

impl MockSession {
    fn reply_for(&self, command: &str) -> Option<Reply> {
        self.state
            .rules
            .lock()
            .unwrap()
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, reply)| reply.clone())
    }
}

#[async_trait]
impl RemoteSession for MockSession {
    async fn exec(&self, command: &str, timeout: Duration) -> Result<CommandOutput, RemoteError> {
        self.state
            .commands
            .lock()
            .unwrap()
            .push((self.identity.clone(), command.to_string()));
        self.state
            .dispatch_log
            .lock()
            .unwrap()
            .push(format!("start:{}", command));

        let delay = *self.state.exec_delay.lock().unwrap();
        let timed_out = match delay {
            Some(delay) if delay > timeout => {
                tokio::time::sleep(timeout).await;
                true
            }
            Some(delay) => {
                tokio::time::sleep(delay).await;
                false
            }
            None => false,
        };

        self.state
            .dispatch_log
            .lock()
            .unwrap()
            .push(format!("end:{}", command));

        if timed_out {
            // Same shape as a real channel cut off mid-command.
            return Ok(CommandOutput {
                timed_out: true,
                ..CommandOutput::default()
            });
        }

        match self.reply_for(command) {
            Some(Reply::Output(output)) => Ok(output),
            Some(Reply::Drop(reason)) => {
                self.alive.store(false, Ordering::SeqCst);
                Err(RemoteError::connection(self.identity.description(), reason))
            }
            None => Ok(CommandOutput::exited(0, "", "")),
        }
    }

    async fn open_tunnel(&self, _host: &str, _port: u16) -> Result<TunnelStream, RemoteError> {
        self.state.tunnels.fetch_add(1, Ordering::SeqCst);
        let (stream, _peer) = tokio::io::duplex(64);
        Ok(Box::pin(stream))
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), RemoteError> {
        self.alive.store(false, Ordering::SeqCst);
        *self
            .state
            .closed
            .lock()
            .unwrap()
            .entry(self.identity.clone())
            .or_default() += 1;
        if self.state.fail_close.load(Ordering::SeqCst) {
            return Err(RemoteError::connection(
                self.identity.description(),
                "Disconnect failed: broken pipe",
            ));
        }
        Ok(())
    }
}

//! Pooled sessions, one per identity.
//!
//! The pool owns two concurrent maps: identity to live session, and identity
//! to its lock. `DashMap::entry` makes lock creation atomic, so two callers
//! seeing an identity for the first time still end up sharing one lock.
//!
//! [`ConnectionPool::acquire`] hands back a [`PooledSession`] that holds the
//! identity's lock until it is dropped. Callers dispatch while holding it,
//! which gives every identity a total order over its commands while distinct
//! identities proceed in parallel.

use std::ops::Deref;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use super::config::ConnectionOptions;
use super::error::RemoteError;
use super::gateway;
use super::identity::HostIdentity;
use super::transport::{Connector, RemoteSession};

struct PoolEntry {
    session: Arc<dyn RemoteSession>,
    connected_at: DateTime<Utc>,
    reuse_count: u64,
}

/// Snapshot of one pooled session.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub identity: String,
    /// RFC3339 timestamp of the connect that created the session
    pub connected_at: String,
    pub reuse_count: u64,
    pub alive: bool,
}

/// A session checked out of the pool.
///
/// Holds the identity lock; no other caller can acquire the same identity
/// until this is dropped.
pub struct PooledSession {
    session: Arc<dyn RemoteSession>,
    reused: bool,
    _guard: OwnedMutexGuard<()>,
}

impl PooledSession {
    /// Whether the session was already pooled, i.e. no connect happened.
    pub fn reused(&self) -> bool {
        self.reused
    }
}

impl Deref for PooledSession {
    type Target = dyn RemoteSession;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref()
    }
}

pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    options: ConnectionOptions,
    sessions: DashMap<HostIdentity, PoolEntry>,
    locks: DashMap<HostIdentity, Arc<Mutex<()>>>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, options: ConnectionOptions) -> Self {
        Self {
            connector,
            options,
            sessions: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Lock for `identity`, created on first sight and never removed.
    fn lock_for(&self, identity: &HostIdentity) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .entry(identity.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// Check out the session for `identity`, connecting if needed.
    ///
    /// A pooled session that is still alive is returned without any network
    /// round trip. A dead one is closed and replaced. When connecting fails
    /// the pool keeps no entry, so the next call starts from scratch.
    pub async fn acquire(&self, identity: &HostIdentity) -> Result<PooledSession, RemoteError> {
        let guard = self.lock_for(identity).lock_owned().await;

        if let Some(session) = self.take_live(identity).await {
            debug!("Reusing pooled session for {}", identity);
            return Ok(PooledSession {
                session,
                reused: true,
                _guard: guard,
            });
        }

        let session = match gateway::establish(self.connector.as_ref(), identity, &self.options).await
        {
            Ok(session) => session,
            Err(e) => {
                error!("Failed to connect to {}: {}", identity, e);
                self.sessions.remove(identity);
                return Err(e);
            }
        };

        info!("Pooled new session for {}", identity);
        self.sessions.insert(
            identity.clone(),
            PoolEntry {
                session: Arc::clone(&session),
                connected_at: Utc::now(),
                reuse_count: 0,
            },
        );

        Ok(PooledSession {
            session,
            reused: false,
            _guard: guard,
        })
    }

    /// Live pooled session for `identity`. A dead one is evicted and closed.
    async fn take_live(&self, identity: &HostIdentity) -> Option<Arc<dyn RemoteSession>> {
        {
            let mut entry = self.sessions.get_mut(identity)?;
            if entry.session.is_alive() {
                entry.reuse_count += 1;
                return Some(Arc::clone(&entry.session));
            }
        }

        warn!("Pooled session for {} is dead, reconnecting", identity);
        if let Some((_, dead)) = self.sessions.remove(identity)
            && let Err(e) = dead.session.close().await
        {
            debug!("Closing dead session for {} failed: {}", identity, e);
        }
        None
    }

    /// Drop the pooled session for `identity`, closing it best-effort.
    ///
    /// Does not take the identity lock, so it is safe to call while holding
    /// a [`PooledSession`] for the same identity.
    pub async fn discard(&self, identity: &HostIdentity) {
        if let Some((_, entry)) = self.sessions.remove(identity) {
            info!("Discarding pooled session for {}", identity);
            if let Err(e) = entry.session.close().await {
                warn!("Failed to close session for {}: {}", identity, e);
            }
        }
    }

    /// Close every pooled session. Individual close failures are logged.
    pub async fn shutdown(&self) {
        let identities: Vec<HostIdentity> =
            self.sessions.iter().map(|entry| entry.key().clone()).collect();

        info!("Shutting down pool with {} sessions", identities.len());
        for identity in identities {
            self.discard(&identity).await;
        }
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<PoolStats> = self
            .sessions
            .iter()
            .map(|entry| PoolStats {
                identity: entry.key().description(),
                connected_at: entry.connected_at.to_rfc3339(),
                reuse_count: entry.reuse_count,
                alive: entry.session.is_alive(),
            })
            .collect();
        stats.sort_by(|a, b| a.identity.cmp(&b.identity));
        stats
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::mock::MockConnector;
    use std::time::Duration;

    fn pool_with(connector: &MockConnector) -> ConnectionPool {
        ConnectionPool::new(Arc::new(connector.clone()), ConnectionOptions::default())
    }

    fn amari() -> HostIdentity {
        HostIdentity::new("10.0.0.5", "root", 22)
    }

    mod reuse {
        use super::*;

        #[tokio::test]
        async fn test_repeated_acquire_connects_once() {
            let connector = MockConnector::new();
            let pool = pool_with(&connector);

            let first = pool.acquire(&amari()).await.unwrap();
            assert!(!first.reused());
            drop(first);

            for _ in 0..3 {
                let again = pool.acquire(&amari()).await.unwrap();
                assert!(again.reused());
            }
            assert_eq!(connector.connect_count(&amari()), 1);
        }

        #[tokio::test]
        async fn test_dead_session_replaced_exactly_once() {
            let connector = MockConnector::new();
            let pool = pool_with(&connector);

            drop(pool.acquire(&amari()).await.unwrap());
            connector.kill(&amari());

            let replaced = pool.acquire(&amari()).await.unwrap();
            assert!(!replaced.reused());
            drop(replaced);
            drop(pool.acquire(&amari()).await.unwrap());

            assert_eq!(connector.connect_count(&amari()), 2);
            assert_eq!(connector.closed_count(&amari()), 1);
        }

        #[tokio::test]
        async fn test_identities_differing_in_port_are_separate() {
            let connector = MockConnector::new();
            let pool = pool_with(&connector);
            let other = HostIdentity::new("10.0.0.5", "root", 2222);

            drop(pool.acquire(&amari()).await.unwrap());
            drop(pool.acquire(&other).await.unwrap());
            assert_eq!(pool.len(), 2);
            assert_eq!(connector.total_connects(), 2);
        }
    }

    mod failures {
        use super::*;

        #[tokio::test]
        async fn test_connect_failure_leaves_no_entry() {
            let connector = MockConnector::new();
            let pool = pool_with(&connector);
            connector.fail_connect(&amari(), "Connection refused");

            let err = pool.acquire(&amari()).await.err().unwrap();
            assert!(err.is_connectivity());
            assert!(err.to_string().contains("root@10.0.0.5:22"));
            assert!(pool.is_empty());

            connector.clear_failure(&amari());
            let pooled = pool.acquire(&amari()).await.unwrap();
            assert!(!pooled.reused());
            assert_eq!(connector.connect_count(&amari()), 2);
        }

        #[tokio::test]
        async fn test_discard_forces_reconnect() {
            let connector = MockConnector::new();
            let pool = pool_with(&connector);

            let pooled = pool.acquire(&amari()).await.unwrap();
            pool.discard(&amari()).await;
            drop(pooled);

            drop(pool.acquire(&amari()).await.unwrap());
            assert_eq!(connector.connect_count(&amari()), 2);
        }
    }

    mod locking {
        use super::*;

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn test_concurrent_first_acquires_share_one_connect() {
            let connector = MockConnector::new();
            let pool = Arc::new(pool_with(&connector));

            let handles: Vec<_> = (0..16)
                .map(|_| {
                    let pool = Arc::clone(&pool);
                    tokio::spawn(async move {
                        drop(pool.acquire(&amari()).await.unwrap());
                    })
                })
                .collect();
            for handle in handles {
                handle.await.unwrap();
            }

            assert_eq!(connector.connect_count(&amari()), 1);
        }

        #[tokio::test]
        async fn test_held_session_blocks_same_identity_only() {
            let connector = MockConnector::new();
            let pool = pool_with(&connector);
            let other = HostIdentity::new("10.0.0.6", "root", 22);

            let held = pool.acquire(&amari()).await.unwrap();

            let same = tokio::time::timeout(Duration::from_millis(50), pool.acquire(&amari())).await;
            assert!(same.is_err());

            let different = tokio::time::timeout(Duration::from_millis(50), pool.acquire(&other)).await;
            assert!(different.is_ok());

            drop(held);
        }
    }

    mod lifecycle {
        use super::*;

        #[tokio::test]
        async fn test_shutdown_closes_everything() {
            let connector = MockConnector::new();
            let pool = pool_with(&connector);
            let other = HostIdentity::new("10.0.0.6", "root", 22);

            drop(pool.acquire(&amari()).await.unwrap());
            drop(pool.acquire(&other).await.unwrap());
            pool.shutdown().await;

            assert!(pool.is_empty());
            assert_eq!(connector.closed_count(&amari()), 1);
            assert_eq!(connector.closed_count(&other), 1);
        }

        #[tokio::test]
        async fn test_shutdown_survives_close_failures() {
            let connector = MockConnector::new();
            let pool = pool_with(&connector);
            let other = HostIdentity::new("10.0.0.6", "root", 22);

            drop(pool.acquire(&amari()).await.unwrap());
            drop(pool.acquire(&other).await.unwrap());
            connector.fail_close();
            pool.shutdown().await;

            assert!(pool.is_empty());
            assert_eq!(connector.closed_count(&amari()), 1);
            assert_eq!(connector.closed_count(&other), 1);

            // Nothing stale is handed out afterwards.
            let fresh = pool.acquire(&amari()).await.unwrap();
            assert!(!fresh.reused());
        }

        #[tokio::test]
        async fn test_stats_track_reuse() {
            let connector = MockConnector::new();
            let pool = pool_with(&connector);

            for _ in 0..3 {
                drop(pool.acquire(&amari()).await.unwrap());
            }

            let stats = pool.stats();
            assert_eq!(stats.len(), 1);
            assert_eq!(stats[0].identity, "root@10.0.0.5:22");
            assert_eq!(stats[0].reuse_count, 2);
            assert!(stats[0].alive);
            assert!(DateTime::parse_from_rfc3339(&stats[0].connected_at).is_ok());
        }
    }
}

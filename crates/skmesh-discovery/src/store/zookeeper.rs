//! ZooKeeper-backed coordination store
//!
//! One `zookeeper_client::Client` per session. The client reports state
//! changes through its state watcher; they are forwarded as `SessionEvent`s
//! until the session reaches a terminal state, after which the event stream
//! ends. Closing the session drops the client, which ends the server-side
//! session and removes its ephemeral nodes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};
use zookeeper_client as zk;

use super::{
    ANY_VERSION, ChildWatch, CoordinationStore, PROTECTED_PREFIX, SessionEvent, SessionState,
    Stat, StoreSession, WatchEvent,
};
use crate::error::{StoreError, StoreResult};

const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Opens sessions against a ZooKeeper ensemble.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZooKeeperStore;

impl ZooKeeperStore {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CoordinationStore for ZooKeeperStore {
    async fn connect(
        &self,
        servers: &[String],
        timeout: Duration,
    ) -> StoreResult<(Arc<dyn StoreSession>, mpsc::Receiver<SessionEvent>)> {
        let cluster = servers.join(",");
        let client = tokio::time::timeout(timeout, zk::Client::connect(&cluster))
            .await
            .map_err(|_| StoreError::ConnectionLoss(cluster.clone()))?
            .map_err(|e| store_error(e, &cluster))?;
        info!("ZooKeeper session established on {}", cluster);

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let _ = tx.try_send(SessionEvent {
            state: SessionState::HasSession,
            server: cluster.clone(),
        });

        let mut watcher = client.state_watcher();
        let server = cluster.clone();
        tokio::spawn(async move {
            loop {
                let state = session_state(watcher.changed().await);
                debug!("ZooKeeper session on {} is {:?}", server, state);
                let event = SessionEvent {
                    state,
                    server: server.clone(),
                };
                if tx.send(event).await.is_err() || is_terminal(state) {
                    break;
                }
            }
        });

        let session = ZooKeeperSession {
            server: cluster,
            client: RwLock::new(Some(client)),
        };
        Ok((Arc::new(session), rx))
    }
}

struct ZooKeeperSession {
    server: String,
    client: RwLock<Option<zk::Client>>,
}

impl ZooKeeperSession {
    fn client(&self) -> StoreResult<zk::Client> {
        self.client.read().clone().ok_or(StoreError::SessionClosed)
    }

    fn error(&self, err: zk::Error, path: &str) -> StoreError {
        store_error(err, path)
    }
}

#[async_trait]
impl StoreSession for ZooKeeperSession {
    fn server(&self) -> &str {
        &self.server
    }

    fn state(&self) -> SessionState {
        match self.client.read().as_ref() {
            Some(client) => session_state(client.state()),
            None => SessionState::Closed,
        }
    }

    async fn get(&self, path: &str) -> StoreResult<(Vec<u8>, Stat)> {
        let (data, stat) = self
            .client()?
            .get_data(path)
            .await
            .map_err(|e| self.error(e, path))?;
        Ok((data, Stat {
            version: stat.version,
        }))
    }

    async fn exists(&self, path: &str) -> StoreResult<Option<Stat>> {
        let stat = self
            .client()?
            .check_stat(path)
            .await
            .map_err(|e| self.error(e, path))?;
        Ok(stat.map(|stat| Stat {
            version: stat.version,
        }))
    }

    async fn create(&self, path: &str, data: &[u8]) -> StoreResult<String> {
        let options = zk::CreateMode::Persistent.with_acls(zk::Acls::anyone_all());
        self.client()?
            .create(path, data, &options)
            .await
            .map_err(|e| self.error(e, path))?;
        Ok(path.to_string())
    }

    async fn create_protected_ephemeral_sequential(
        &self,
        prefix: &str,
        data: &[u8],
    ) -> StoreResult<String> {
        let name = format!(
            "{}{}{}-",
            prefix,
            PROTECTED_PREFIX,
            uuid::Uuid::new_v4().simple()
        );
        let options = zk::CreateMode::EphemeralSequential.with_acls(zk::Acls::anyone_all());
        let (_, sequence) = self
            .client()?
            .create(&name, data, &options)
            .await
            .map_err(|e| self.error(e, &name))?;
        Ok(format!("{}{}", name, sequence))
    }

    async fn set(&self, path: &str, data: &[u8], version: i32) -> StoreResult<Stat> {
        let stat = self
            .client()?
            .set_data(path, data, expected_version(version))
            .await
            .map_err(|e| version_error(self.error(e, path), version))?;
        Ok(Stat {
            version: stat.version,
        })
    }

    async fn delete(&self, path: &str, version: i32) -> StoreResult<()> {
        self.client()?
            .delete(path, expected_version(version))
            .await
            .map_err(|e| version_error(self.error(e, path), version))
    }

    async fn children_watch(&self, path: &str) -> StoreResult<(Vec<String>, ChildWatch)> {
        let (children, _, watcher) = self
            .client()?
            .get_and_watch_children(path)
            .await
            .map_err(|e| self.error(e, path))?;

        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let event = watcher.changed().await;
            let event = match event.event_type {
                zk::EventType::NodeChildrenChanged => WatchEvent::ChildrenChanged(event.path),
                zk::EventType::NodeDeleted => WatchEvent::NodeDeleted(event.path),
                // Session events end the watch; the receiver sees it dropped.
                _ => return,
            };
            let _ = tx.send(event);
        });

        Ok((children, rx))
    }

    async fn close(&self) {
        if self.client.write().take().is_some() {
            debug!("ZooKeeper session on {} closed", self.server);
        }
    }
}

fn expected_version(version: i32) -> Option<i32> {
    (version != ANY_VERSION).then_some(version)
}

fn version_error(err: StoreError, expected: i32) -> StoreError {
    match err {
        StoreError::BadVersion { path, .. } => StoreError::BadVersion {
            path,
            expected,
            actual: ANY_VERSION,
        },
        other => other,
    }
}

fn session_state(state: zk::SessionState) -> SessionState {
    match state {
        zk::SessionState::SyncConnected => SessionState::HasSession,
        zk::SessionState::Disconnected => SessionState::Disconnected,
        zk::SessionState::ConnectedReadOnly => SessionState::ConnectedReadOnly,
        zk::SessionState::AuthFailed => SessionState::AuthFailed,
        zk::SessionState::Expired => SessionState::Expired,
        zk::SessionState::Closed => SessionState::Closed,
        #[allow(unreachable_patterns)]
        _ => SessionState::Connecting,
    }
}

fn is_terminal(state: SessionState) -> bool {
    matches!(
        state,
        SessionState::Expired | SessionState::Closed | SessionState::AuthFailed
    )
}

fn store_error(err: zk::Error, path: &str) -> StoreError {
    let path = path.to_string();
    match err {
        zk::Error::NoNode => StoreError::NoNode(path),
        zk::Error::NodeExists => StoreError::NodeExists(path),
        zk::Error::BadVersion => StoreError::BadVersion {
            path,
            expected: ANY_VERSION,
            actual: ANY_VERSION,
        },
        zk::Error::NoAuth => StoreError::NoAuth(path),
        zk::Error::NotEmpty => StoreError::NotEmpty(path),
        zk::Error::BadArguments(reason) => StoreError::InvalidPath(format!("{}: {}", path, reason)),
        zk::Error::SessionExpired | zk::Error::ClientClosed => StoreError::SessionClosed,
        other => StoreError::ConnectionLoss(format!("{}: {}", path, other)),
    }
}

//! Coordination store seam
//!
//! The registrar and subscriber only need a small hierarchical key/value API
//! with versioned writes, ephemeral sequential nodes and one-shot child
//! watches. `CoordinationStore` opens sessions; `StoreSession` carries the
//! operations of one session.
//!
//! `MemoryStore` keeps everything in process. With the `zookeeper` feature,
//! `ZooKeeperStore` talks to a ZooKeeper ensemble.

mod memory;
#[cfg(feature = "zookeeper")]
mod zookeeper;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

pub use memory::MemoryStore;
#[cfg(feature = "zookeeper")]
pub use zookeeper::ZooKeeperStore;

use crate::error::StoreResult;

/// Version accepted by `set` / `delete` regardless of the current version
pub const ANY_VERSION: i32 = -1;

/// Name prefix of protected ephemeral sequential children
pub const PROTECTED_PREFIX: &str = "_c_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    HasSession,
    Disconnected,
    Expired,
    AuthFailed,
    ConnectedReadOnly,
    Closed,
}

impl SessionState {
    /// Whether requests can still be issued on the session.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            SessionState::Connected | SessionState::HasSession | SessionState::ConnectedReadOnly
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub state: SessionState,
    pub server: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub version: i32,
}

/// Delivered once by a child watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    ChildrenChanged(String),
    NodeDeleted(String),
}

pub type ChildWatch = oneshot::Receiver<WatchEvent>;

#[async_trait]
pub trait StoreSession: Send + Sync {
    /// Server the session is attached to.
    fn server(&self) -> &str;

    fn state(&self) -> SessionState;

    async fn get(&self, path: &str) -> StoreResult<(Vec<u8>, Stat)>;

    /// Stat of the node, `None` when it does not exist.
    async fn exists(&self, path: &str) -> StoreResult<Option<Stat>>;

    /// Create a persistent node; returns the created path.
    async fn create(&self, path: &str, data: &[u8]) -> StoreResult<String>;

    /// Create an ephemeral sequential child under `prefix` (a parent path
    /// ending in `/`), named with the protected prefix so it can be told
    /// apart from other children. Returns the created path.
    async fn create_protected_ephemeral_sequential(
        &self,
        prefix: &str,
        data: &[u8],
    ) -> StoreResult<String>;

    async fn set(&self, path: &str, data: &[u8], version: i32) -> StoreResult<Stat>;

    async fn delete(&self, path: &str, version: i32) -> StoreResult<()>;

    /// List child names and leave a one-shot watch on the child list.
    async fn children_watch(&self, path: &str) -> StoreResult<(Vec<String>, ChildWatch)>;

    /// End the session. Ephemeral nodes owned by it are removed.
    async fn close(&self);
}

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Open a session. The returned receiver yields session state changes
    /// and ends when the session is closed.
    async fn connect(
        &self,
        servers: &[String],
        timeout: Duration,
    ) -> StoreResult<(Arc<dyn StoreSession>, mpsc::Receiver<SessionEvent>)>;
}

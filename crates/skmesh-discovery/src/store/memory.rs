//! In-process coordination store
//!
//! Hierarchical nodes with data and version, ephemeral nodes owned by a
//! session, protected sequential child names and one-shot child watches.
//! Faults (connect failures, write failures, session events, expiry) can be
//! injected so the session state machine can be driven deterministically.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::{
    ANY_VERSION, ChildWatch, CoordinationStore, PROTECTED_PREFIX, SessionEvent, SessionState,
    Stat, StoreSession, WatchEvent,
};
use crate::error::{StoreError, StoreResult};

const EVENT_CHANNEL_CAPACITY: usize = 32;
const DEFAULT_SERVER: &str = "memory";

struct Node {
    data: Vec<u8>,
    version: i32,
    owner: Option<u64>,
}

struct PendingWatch {
    session: u64,
    tx: oneshot::Sender<WatchEvent>,
}

struct Tree {
    nodes: BTreeMap<String, Node>,
    sequences: HashMap<String, u64>,
    child_watches: HashMap<String, Vec<PendingWatch>>,
}

impl Tree {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            Node {
                data: Vec::new(),
                version: 0,
                owner: None,
            },
        );
        Self {
            nodes,
            sequences: HashMap::new(),
            child_watches: HashMap::new(),
        }
    }

    fn create(&mut self, path: &str, data: &[u8], owner: Option<u64>) -> StoreResult<String> {
        validate_path(path)?;
        if self.nodes.contains_key(path) {
            return Err(StoreError::NodeExists(path.to_string()));
        }

        let parent = parent_of(path);
        if !self.nodes.contains_key(parent) {
            return Err(StoreError::NoNode(parent.to_string()));
        }

        self.nodes.insert(
            path.to_string(),
            Node {
                data: data.to_vec(),
                version: 0,
                owner,
            },
        );
        let parent = parent.to_string();
        self.fire(&parent, WatchEvent::ChildrenChanged(parent.clone()));
        Ok(path.to_string())
    }

    fn create_protected_sequential(
        &mut self,
        prefix: &str,
        data: &[u8],
        owner: Option<u64>,
    ) -> StoreResult<String> {
        let Some(dir) = prefix.strip_suffix('/') else {
            return Err(StoreError::InvalidPath(prefix.to_string()));
        };
        let dir = if dir.is_empty() { "/" } else { dir };
        if !self.nodes.contains_key(dir) {
            return Err(StoreError::NoNode(dir.to_string()));
        }

        let seq = self.sequences.entry(dir.to_string()).or_insert(0);
        let path = format!(
            "{}{}{}-{:010}",
            prefix,
            PROTECTED_PREFIX,
            uuid::Uuid::new_v4().simple(),
            *seq
        );
        *seq += 1;

        self.create(&path, data, owner)
    }

    fn set(&mut self, path: &str, data: &[u8], version: i32) -> StoreResult<Stat> {
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
        if version != ANY_VERSION && version != node.version {
            return Err(StoreError::BadVersion {
                path: path.to_string(),
                expected: version,
                actual: node.version,
            });
        }

        node.data = data.to_vec();
        node.version += 1;
        Ok(Stat {
            version: node.version,
        })
    }

    fn delete(&mut self, path: &str, version: i32) -> StoreResult<()> {
        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
        if version != ANY_VERSION && version != node.version {
            return Err(StoreError::BadVersion {
                path: path.to_string(),
                expected: version,
                actual: node.version,
            });
        }
        if !self.children(path).is_empty() {
            return Err(StoreError::NotEmpty(path.to_string()));
        }

        self.nodes.remove(path);
        self.fire(path, WatchEvent::NodeDeleted(path.to_string()));
        let parent = parent_of(path).to_string();
        self.fire(&parent, WatchEvent::ChildrenChanged(parent.clone()));
        Ok(())
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };

        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let name = &key[prefix.len()..];
                (!name.is_empty() && !name.contains('/')).then(|| name.to_string())
            })
            .collect()
    }

    fn fire(&mut self, path: &str, event: WatchEvent) {
        if let Some(watches) = self.child_watches.remove(path) {
            for watch in watches {
                let _ = watch.tx.send(event.clone());
            }
        }
    }

    /// Remove every ephemeral node and pending watch of a session.
    fn release_session(&mut self, session: u64) {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();

        for path in owned {
            if let Err(e) = self.delete(&path, ANY_VERSION) {
                debug!("Failed to remove ephemeral node {}: {}", path, e);
            }
        }

        for watches in self.child_watches.values_mut() {
            watches.retain(|watch| watch.session != session);
        }
        self.child_watches.retain(|_, watches| !watches.is_empty());
    }
}

fn validate_path(path: &str) -> StoreResult<()> {
    if !path.starts_with('/') || (path.len() > 1 && path.ends_with('/')) || path.contains("//") {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(())
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

struct SessionShared {
    id: u64,
    server: String,
    state: Mutex<SessionState>,
    events: Mutex<Option<mpsc::Sender<SessionEvent>>>,
}

impl SessionShared {
    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
        let events = self.events.lock();
        if let Some(tx) = events.as_ref()
            && tx
                .try_send(SessionEvent {
                    state,
                    server: self.server.clone(),
                })
                .is_err()
        {
            debug!("Session {} event {:?} not delivered", self.id, state);
        }
    }

    fn check_usable(&self) -> StoreResult<()> {
        match *self.state.lock() {
            SessionState::Closed | SessionState::Expired => Err(StoreError::SessionClosed),
            SessionState::Disconnected | SessionState::Connecting => {
                Err(StoreError::ConnectionLoss(self.server.clone()))
            }
            _ => Ok(()),
        }
    }
}

struct Inner {
    tree: Mutex<Tree>,
    sessions: DashMap<u64, Arc<SessionShared>>,
    next_session_id: AtomicU64,
    connect_failures: AtomicUsize,
    create_faults: Mutex<HashMap<String, usize>>,
}

impl Inner {
    fn take_create_fault(&self, path: &str) -> bool {
        let mut faults = self.create_faults.lock();
        match faults.get_mut(path) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn live_sessions(&self) -> Vec<Arc<SessionShared>> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn end_session(&self, shared: &SessionShared, state: SessionState) {
        self.sessions.remove(&shared.id);
        self.tree.lock().release_session(shared.id);
        shared.set_state(state);
        shared.events.lock().take();
    }
}

/// In-process `CoordinationStore`. Clones share the same tree.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                tree: Mutex::new(Tree::new()),
                sessions: DashMap::new(),
                next_session_id: AtomicU64::new(1),
                connect_failures: AtomicUsize::new(0),
                create_faults: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Make the next `count` connect attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        self.inner.connect_failures.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` persistent creates of exactly `path` fail with
    /// a connection loss.
    pub fn fail_next_creates(&self, path: &str, count: usize) {
        self.inner
            .create_faults
            .lock()
            .insert(path.to_string(), count);
    }

    /// Deliver a session state change to every live session.
    pub fn broadcast(&self, state: SessionState) {
        for session in self.inner.live_sessions() {
            session.set_state(state);
        }
    }

    /// Expire every live session: ephemeral nodes are removed, pending
    /// watches are dropped and the session reports `Expired` then
    /// `Disconnected`.
    pub fn expire_sessions(&self) {
        for session in self.inner.live_sessions() {
            self.inner.sessions.remove(&session.id);
            self.inner.tree.lock().release_session(session.id);
            session.set_state(SessionState::Expired);
            if let Some(tx) = session.events.lock().as_ref() {
                let _ = tx.try_send(SessionEvent {
                    state: SessionState::Disconnected,
                    server: session.server.clone(),
                });
            }
        }
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Create a persistent node and any missing parents, overwriting data.
    pub fn put(&self, path: &str, data: &[u8]) -> StoreResult<()> {
        validate_path(path)?;
        let mut tree = self.inner.tree.lock();

        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            if !tree.nodes.contains_key(&current) {
                tree.create(&current, &[], None)?;
            }
        }
        tree.set(path, data, ANY_VERSION)?;
        Ok(())
    }

    pub fn data(&self, path: &str) -> Option<Vec<u8>> {
        self.inner
            .tree
            .lock()
            .nodes
            .get(path)
            .map(|node| node.data.clone())
    }

    pub fn version(&self, path: &str) -> Option<i32> {
        self.inner.tree.lock().nodes.get(path).map(|node| node.version)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.inner.tree.lock().nodes.contains_key(path)
    }

    pub fn children(&self, path: &str) -> Vec<String> {
        self.inner.tree.lock().children(path)
    }

    /// Delete a node (and its subtree) outside of any session.
    pub fn remove(&self, path: &str) {
        let mut tree = self.inner.tree.lock();
        let mut doomed: Vec<String> = tree
            .nodes
            .keys()
            .filter(|key| key.as_str() == path || key.starts_with(&format!("{}/", path)))
            .cloned()
            .collect();
        // Deepest first so every delete sees an empty node.
        doomed.sort_by_key(|p| std::cmp::Reverse(p.len()));
        for p in doomed {
            let _ = tree.delete(&p, ANY_VERSION);
        }
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn connect(
        &self,
        servers: &[String],
        _timeout: Duration,
    ) -> StoreResult<(Arc<dyn StoreSession>, mpsc::Receiver<SessionEvent>)> {
        let server = servers
            .first()
            .cloned()
            .unwrap_or_else(|| DEFAULT_SERVER.to_string());

        let injected = self
            .inner
            .connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::ConnectionLoss(server));
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(SessionShared {
            id: self.inner.next_session_id.fetch_add(1, Ordering::SeqCst),
            server,
            state: Mutex::new(SessionState::Connecting),
            events: Mutex::new(Some(tx)),
        });
        self.inner.sessions.insert(shared.id, shared.clone());

        shared.set_state(SessionState::Connected);
        shared.set_state(SessionState::HasSession);
        debug!("Memory store session {} established", shared.id);

        let session: Arc<dyn StoreSession> = Arc::new(MemorySession {
            inner: self.inner.clone(),
            shared,
        });
        Ok((session, rx))
    }
}

struct MemorySession {
    inner: Arc<Inner>,
    shared: Arc<SessionShared>,
}

#[async_trait]
impl StoreSession for MemorySession {
    fn server(&self) -> &str {
        &self.shared.server
    }

    fn state(&self) -> SessionState {
        *self.shared.state.lock()
    }

    async fn get(&self, path: &str) -> StoreResult<(Vec<u8>, Stat)> {
        self.shared.check_usable()?;
        let tree = self.inner.tree.lock();
        let node = tree
            .nodes
            .get(path)
            .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
        Ok((
            node.data.clone(),
            Stat {
                version: node.version,
            },
        ))
    }

    async fn exists(&self, path: &str) -> StoreResult<Option<Stat>> {
        self.shared.check_usable()?;
        let tree = self.inner.tree.lock();
        Ok(tree.nodes.get(path).map(|node| Stat {
            version: node.version,
        }))
    }

    async fn create(&self, path: &str, data: &[u8]) -> StoreResult<String> {
        self.shared.check_usable()?;
        if self.inner.take_create_fault(path) {
            return Err(StoreError::ConnectionLoss(self.shared.server.clone()));
        }
        self.inner.tree.lock().create(path, data, None)
    }

    async fn create_protected_ephemeral_sequential(
        &self,
        prefix: &str,
        data: &[u8],
    ) -> StoreResult<String> {
        self.shared.check_usable()?;
        self.inner
            .tree
            .lock()
            .create_protected_sequential(prefix, data, Some(self.shared.id))
    }

    async fn set(&self, path: &str, data: &[u8], version: i32) -> StoreResult<Stat> {
        self.shared.check_usable()?;
        self.inner.tree.lock().set(path, data, version)
    }

    async fn delete(&self, path: &str, version: i32) -> StoreResult<()> {
        self.shared.check_usable()?;
        self.inner.tree.lock().delete(path, version)
    }

    async fn children_watch(&self, path: &str) -> StoreResult<(Vec<String>, ChildWatch)> {
        self.shared.check_usable()?;
        let mut tree = self.inner.tree.lock();
        if !tree.nodes.contains_key(path) {
            return Err(StoreError::NoNode(path.to_string()));
        }

        let children = tree.children(path);
        let (tx, rx) = oneshot::channel();
        tree.child_watches
            .entry(path.to_string())
            .or_default()
            .push(PendingWatch {
                session: self.shared.id,
                tx,
            });
        Ok((children, rx))
    }

    async fn close(&self) {
        if self.state() == SessionState::Closed {
            return;
        }
        self.inner.end_session(&self.shared, SessionState::Closed);
        debug!("Memory store session {} closed", self.shared.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn session(store: &MemoryStore) -> (Arc<dyn StoreSession>, mpsc::Receiver<SessionEvent>) {
        store
            .connect(&["zk-1:2181".to_string()], Duration::from_secs(30))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_connect_reports_session_events() {
        let store = MemoryStore::new();
        let (session, mut events) = session(&store).await;

        assert_eq!(events.recv().await.unwrap().state, SessionState::Connected);
        let event = events.recv().await.unwrap();
        assert_eq!(event.state, SessionState::HasSession);
        assert_eq!(event.server, "zk-1:2181");
        assert_eq!(session.state(), SessionState::HasSession);

        session.close().await;
        assert_eq!(events.recv().await.unwrap().state, SessionState::Closed);
        assert!(events.recv().await.is_none());
        assert_eq!(store.session_count(), 0);
    }

    #[tokio::test]
    async fn test_create_requires_parent() {
        let store = MemoryStore::new();
        let (session, _events) = session(&store).await;

        assert!(matches!(
            session.create("/a/b", b"").await,
            Err(StoreError::NoNode(p)) if p == "/a"
        ));
        session.create("/a", b"").await.unwrap();
        session.create("/a/b", b"x").await.unwrap();
        assert!(matches!(
            session.create("/a/b", b"").await,
            Err(StoreError::NodeExists(_))
        ));
        assert_eq!(session.get("/a/b").await.unwrap().0, b"x".to_vec());
    }

    #[tokio::test]
    async fn test_versioned_set_and_delete() {
        let store = MemoryStore::new();
        let (session, _events) = session(&store).await;
        session.create("/p", b"v0").await.unwrap();

        let stat = session.set("/p", b"v1", 0).await.unwrap();
        assert_eq!(stat.version, 1);
        assert_eq!(session.exists("/p").await.unwrap(), Some(Stat { version: 1 }));
        assert!(matches!(
            session.set("/p", b"v2", 0).await,
            Err(StoreError::BadVersion { expected: 0, actual: 1, .. })
        ));
        assert!(matches!(
            session.delete("/p", 0).await,
            Err(StoreError::BadVersion { .. })
        ));
        session.delete("/p", 1).await.unwrap();
        assert!(matches!(session.delete("/p", 1).await, Err(StoreError::NoNode(_))));
        assert_eq!(session.exists("/p").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_protected_sequential_names() {
        let store = MemoryStore::new();
        store.put("/svc/nodes", b"").unwrap();
        let (session, _events) = session(&store).await;

        let first = session
            .create_protected_ephemeral_sequential("/svc/nodes/", b"1")
            .await
            .unwrap();
        let second = session
            .create_protected_ephemeral_sequential("/svc/nodes/", b"2")
            .await
            .unwrap();

        assert!(first.starts_with("/svc/nodes/_c_"));
        assert!(first.ends_with("-0000000000"));
        assert!(second.ends_with("-0000000001"));
        assert_eq!(store.children("/svc/nodes").len(), 2);
    }

    #[tokio::test]
    async fn test_ephemeral_nodes_removed_with_session() {
        let store = MemoryStore::new();
        store.put("/svc/nodes", b"").unwrap();
        let (owner, _owner_events) = session(&store).await;
        let (watcher, _watcher_events) = session(&store).await;

        owner
            .create_protected_ephemeral_sequential("/svc/nodes/", b"{}")
            .await
            .unwrap();
        let (children, watch) = watcher.children_watch("/svc/nodes").await.unwrap();
        assert_eq!(children.len(), 1);

        owner.close().await;
        assert_eq!(
            watch.await.unwrap(),
            WatchEvent::ChildrenChanged("/svc/nodes".to_string())
        );
        assert!(store.children("/svc/nodes").is_empty());
        assert!(matches!(owner.get("/svc").await, Err(StoreError::SessionClosed)));
    }

    #[tokio::test]
    async fn test_watch_dropped_when_watcher_session_ends() {
        let store = MemoryStore::new();
        store.put("/svc/nodes", b"").unwrap();
        let (watcher, _events) = session(&store).await;

        let (_, watch) = watcher.children_watch("/svc/nodes").await.unwrap();
        store.expire_sessions();
        assert!(watch.await.is_err());
        assert_eq!(watcher.state(), SessionState::Expired);
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let store = MemoryStore::new();
        store.fail_next_connects(1);
        assert!(matches!(
            store.connect(&[], Duration::from_secs(1)).await,
            Err(StoreError::ConnectionLoss(_))
        ));

        let (session, _events) = session(&store).await;
        store.fail_next_creates("/x", 1);
        assert!(matches!(
            session.create("/x", b"").await,
            Err(StoreError::ConnectionLoss(_))
        ));
        session.create("/x", b"").await.unwrap();
    }

    #[test]
    fn test_parent_of() {
        assert_eq!(parent_of("/a"), "/");
        assert_eq!(parent_of("/a/b/c"), "/a/b");
    }
}

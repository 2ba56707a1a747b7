//! Service subscription
//!
//! One watch loop per subscribed service lists `{root}/{service}/nodes`,
//! decodes every protected child into a `PeerDescriptor` and hands the full
//! set to the listener, then waits for the child watch to fire.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use skmesh_common::{LocalNode, MeshError, PeerDescriptor, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::DiscoveryConfig;
use crate::error::StoreError;
use crate::session::{SessionClient, SessionHandler};
use crate::store::{CoordinationStore, PROTECTED_PREFIX, StoreSession};

/// Delay before watching a node list that has not been published yet
pub const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(10);

/// Receives the current peer set of a subscribed service.
///
/// Called at least once per observed change. An empty set means the service
/// currently has no peers.
#[async_trait]
pub trait ServiceListener: Send + Sync {
    async fn on_change(&self, service: &str, peers: Vec<PeerDescriptor>);
}

/// A listener that invokes a closure.
pub struct FnServiceListener<F>
where
    F: Fn(&str, Vec<PeerDescriptor>) + Send + Sync + 'static,
{
    f: F,
}

impl<F> FnServiceListener<F>
where
    F: Fn(&str, Vec<PeerDescriptor>) + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> ServiceListener for FnServiceListener<F>
where
    F: Fn(&str, Vec<PeerDescriptor>) + Send + Sync + 'static,
{
    async fn on_change(&self, service: &str, peers: Vec<PeerDescriptor>) {
        (self.f)(service, peers);
    }
}

pub struct Subscriber {
    base: SessionClient,
    items: RwLock<BTreeMap<String, Arc<dyn ServiceListener>>>,
    local: Option<Arc<dyn LocalNode>>,
}

impl Subscriber {
    pub fn new(config: DiscoveryConfig, store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            base: SessionClient::new(config, store),
            items: RwLock::new(BTreeMap::new()),
            local: None,
        }
    }

    /// Exclude the local node from every delivered peer set.
    pub fn with_local_node(mut self, local: Arc<dyn LocalNode>) -> Self {
        self.local = Some(local);
        self
    }

    /// Subscribe to `service`. A second subscription for the same service
    /// replaces the listener.
    pub fn add_subscribe(&self, service: &str, listener: Arc<dyn ServiceListener>) {
        self.items.write().insert(service.to_string(), listener);
    }

    pub fn subscribed(&self) -> Vec<String> {
        self.items.read().keys().cloned().collect()
    }

    pub fn init(&mut self) -> Result<()> {
        if self.items.read().is_empty() {
            return Err(MeshError::config(
                "please add subscribe service name before init",
            ));
        }
        self.base.init()
    }

    /// Run until `close()` or a fatal session error.
    pub async fn work(self: &Arc<Self>) -> Result<()> {
        self.base.run(self.clone()).await
    }

    pub fn close(&self) {
        self.base.close();
    }
}

#[async_trait]
impl SessionHandler for Subscriber {
    async fn on_connect(&self, session: Arc<dyn StoreSession>, scope: CancellationToken) {
        let items: Vec<(String, Arc<dyn ServiceListener>)> = self
            .items
            .read()
            .iter()
            .map(|(service, listener)| (service.clone(), listener.clone()))
            .collect();

        for (service, listener) in items {
            let watch = ServiceWatch {
                nodes_path: self.base.config().nodes_path(&service),
                service,
                listener,
                session: session.clone(),
                scope: scope.child_token(),
                local: self.local.clone(),
            };
            tokio::spawn(watch.run());
        }
    }
}

struct ServiceWatch {
    service: String,
    nodes_path: String,
    listener: Arc<dyn ServiceListener>,
    session: Arc<dyn StoreSession>,
    scope: CancellationToken,
    local: Option<Arc<dyn LocalNode>>,
}

impl ServiceWatch {
    async fn run(self) {
        loop {
            let (children, watch) = match self.session.children_watch(&self.nodes_path).await {
                Ok(listed) => listed,
                Err(StoreError::NoNode(_)) => {
                    warn!(
                        "Subscribe service '{}' node does not exist, path: {}",
                        self.service, self.nodes_path
                    );
                    tokio::select! {
                        _ = self.scope.cancelled() => return,
                        _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => continue,
                    }
                }
                Err(e) => {
                    error!("Watch failed: {}, path: {}", e, self.nodes_path);
                    return;
                }
            };

            let peers = self.read_peers(&children).await;
            self.listener.on_change(&self.service, peers).await;

            tokio::select! {
                _ = self.scope.cancelled() => return,
                event = watch => match event {
                    Ok(event) => debug!("Watch on {} fired: {:?}", self.nodes_path, event),
                    Err(_) => {
                        debug!("Watch on {} dropped, session ended", self.nodes_path);
                        return;
                    }
                },
            }
        }
    }

    async fn read_peers(&self, children: &[String]) -> Vec<PeerDescriptor> {
        let mut peers = Vec::with_capacity(children.len());
        for child in children {
            if !child.starts_with(PROTECTED_PREFIX) {
                continue;
            }

            let path = format!("{}/{}", self.nodes_path, child);
            let data = match self.session.get(&path).await {
                Ok((data, _)) => data,
                Err(e) => {
                    error!("Get service node data failed, {}, node: {}", e, child);
                    continue;
                }
            };
            if data.is_empty() {
                continue;
            }

            let peer: PeerDescriptor = match serde_json::from_slice(&data) {
                Ok(peer) => peer,
                Err(e) => {
                    error!(
                        "Unmarshal service node data failed, {}, node: {}, data: {}",
                        e,
                        child,
                        String::from_utf8_lossy(&data)
                    );
                    continue;
                }
            };

            if let Some(local) = &self.local
                && local.is_self(&peer)
            {
                debug!("Skipping local node {}:{}", peer.name, peer.app_id);
                continue;
            }
            peers.push(peer);
        }
        peers
    }
}

//! Per-service peer registry
//!
//! `NodePool` maps `service -> app_id -> PeerNode`. Each discovery event for a
//! service rebuilds that service's sub-map: peers whose inner endpoint did not
//! change keep their live client, new peers get a freshly connected one. The
//! new sub-map is swapped in under the write lock and the clients that did not
//! survive are closed afterwards, so readers never see a half-closed entry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use skmesh_common::{LocalNode, PeerDescriptor, Result, ServiceNetwork};
use tracing::{debug, error, info, warn};

/// Transport client for one peer.
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    fn network(&self) -> &str;
    fn address(&self) -> &str;
    async fn close(&self);
}

/// A discovered peer paired with its live transport client.
#[derive(Debug)]
pub struct PeerNode<T> {
    pub descriptor: PeerDescriptor,
    pub client: Arc<T>,
}

impl<T> PeerNode<T> {
    pub fn app_id(&self) -> u32 {
        self.descriptor.app_id
    }
}

type ServiceNodes<T> = Arc<HashMap<u32, Arc<PeerNode<T>>>>;

pub struct NodePool<T> {
    services: RwLock<HashMap<String, ServiceNodes<T>>>,
    reconciling: tokio::sync::Mutex<()>,
    local: Option<Arc<dyn LocalNode>>,
}

impl<T> Default for NodePool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> NodePool<T> {
    pub fn new() -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            reconciling: tokio::sync::Mutex::new(()),
            local: None,
        }
    }

    /// Skip descriptors that identify the local process.
    pub fn with_local_node(mut self, local: Arc<dyn LocalNode>) -> Self {
        self.local = Some(local);
        self
    }

    pub fn services(&self) -> Vec<String> {
        self.services.read().keys().cloned().collect()
    }

    /// Snapshot of the peers of `service`, `None` if the service is unknown.
    pub fn nodes(&self, service: &str) -> Option<ServiceNodes<T>> {
        self.services.read().get(service).cloned()
    }

    pub fn node(&self, service: &str, app_id: u32) -> Option<Arc<PeerNode<T>>> {
        self.services
            .read()
            .get(service)
            .and_then(|nodes| nodes.get(&app_id).cloned())
    }

    /// Uniformly random peer of `service`.
    pub fn random_node(&self, service: &str) -> Option<Arc<PeerNode<T>>> {
        let nodes = self.nodes(service)?;
        if nodes.is_empty() {
            return None;
        }
        let index = rand::rng().random_range(0..nodes.len());
        nodes.values().nth(index).cloned()
    }
}

impl<T: PeerTransport> NodePool<T> {
    /// Rebuild the peers of `service` from a discovery event.
    ///
    /// `connect` builds the client for a peer whose endpoint is new. A peer
    /// whose client cannot be built is left out. Returns the newly admitted
    /// nodes.
    pub async fn reconcile<F, Fut>(
        &self,
        service: &str,
        peers: Vec<PeerDescriptor>,
        connect: F,
    ) -> Vec<Arc<PeerNode<T>>>
    where
        F: Fn(ServiceNetwork) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _guard = self.reconciling.lock().await;

        if peers.is_empty() {
            let removed = self.services.write().remove(service);
            warn!(
                "The service subscribe callback received an empty nodes list, service: {}",
                service
            );
            if let Some(removed) = removed {
                close_nodes(service, removed.values()).await;
            }
            return Vec::new();
        }

        let old = self.nodes(service).unwrap_or_default();
        let mut fresh: HashMap<u32, Arc<PeerNode<T>>> = HashMap::with_capacity(peers.len());
        let mut admitted = Vec::new();

        for peer in peers {
            let Some(inner) = peer.inner.clone() else {
                warn!(
                    "The inner network information of the service node is empty, service: {}, appId: {}",
                    service, peer.app_id
                );
                continue;
            };

            if let Some(local) = &self.local
                && local.is_self(&peer)
            {
                debug!("Skipping local node {}:{}", service, peer.app_id);
                continue;
            }

            if fresh.contains_key(&peer.app_id) {
                warn!(
                    "Duplicate app id in service nodes, service: {}, appId: {}",
                    service, peer.app_id
                );
                continue;
            }

            let reusable = old.get(&peer.app_id).filter(|node| {
                node.client.network() == inner.network && node.client.address() == inner.address
            });
            if let Some(existing) = reusable {
                fresh.insert(
                    peer.app_id,
                    Arc::new(PeerNode {
                        descriptor: peer,
                        client: existing.client.clone(),
                    }),
                );
                continue;
            }

            let app_id = peer.app_id;
            match connect(inner.clone()).await {
                Ok(client) => {
                    info!(
                        "Init the service node succeed, service: {}, appId: {}, address: {}",
                        service, app_id, inner.address
                    );
                    let node = Arc::new(PeerNode {
                        descriptor: peer,
                        client: Arc::new(client),
                    });
                    admitted.push(node.clone());
                    fresh.insert(app_id, node);
                }
                Err(e) => {
                    error!(
                        "Init the service node failed, service: {}, appId: {}, error: {}",
                        service, app_id, e
                    );
                }
            }
        }

        self.services
            .write()
            .insert(service.to_string(), Arc::new(fresh.clone()));

        let retired: Vec<&Arc<PeerNode<T>>> = old
            .values()
            .filter(|node| {
                !fresh
                    .values()
                    .any(|kept| Arc::ptr_eq(&kept.client, &node.client))
            })
            .collect();
        close_nodes(service, retired.into_iter()).await;

        admitted
    }

    /// Remove every service and close all clients.
    pub async fn close_all(&self) {
        let services = std::mem::take(&mut *self.services.write());
        for (service, nodes) in services {
            close_nodes(&service, nodes.values()).await;
        }
    }
}

async fn close_nodes<'a, T, I>(service: &str, nodes: I)
where
    T: PeerTransport,
    I: Iterator<Item = &'a Arc<PeerNode<T>>>,
{
    for node in nodes {
        node.client.close().await;
        info!(
            "The service node was closed, service: {}, appId: {}, address: {}",
            service,
            node.app_id(),
            node.client.address()
        );
    }
}

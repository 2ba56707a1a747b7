use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use skmesh_common::{
    LocalNode, MeshError, PeerDescriptor, Result, ServiceNetwork, wait_all, wait_any_success,
};
use skmesh_discovery::ServiceListener;
use skmesh_wire::{Codec, ConnMux, Connection, ConnectionOptions, Frame, NetClient, RawCodec, WireError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{app_id_node, collect_results, random_node, select_nodes, unavailable};
use crate::pool::{NodePool, PeerNode, PeerTransport};
use crate::result::MultiResults;

/// Capacity of the queue feeding the dispatch loop
pub const DISPATCH_QUEUE_CAPACITY: usize = 8;

pub type PeerConnectHandler<C> =
    Arc<dyn Fn(PeerDescriptor, Arc<Connection<C>>) -> BoxFuture<'static, ()> + Send + Sync>;
pub type PeerMessageHandler<C> =
    Arc<dyn Fn(PeerDescriptor, Arc<Connection<C>>, Frame) -> BoxFuture<'static, ()> + Send + Sync>;

type NetNode<C> = Arc<PeerNode<NetClient<C>>>;

struct ServiceHandlers<C> {
    connect: Option<PeerConnectHandler<C>>,
    disconnect: Option<PeerConnectHandler<C>>,
    messages: HashMap<(u16, u16), PeerMessageHandler<C>>,
    fallback: Option<PeerMessageHandler<C>>,
}

impl<C> Default for ServiceHandlers<C> {
    fn default() -> Self {
        Self {
            connect: None,
            disconnect: None,
            messages: HashMap::new(),
            fallback: None,
        }
    }
}

impl<C> Clone for ServiceHandlers<C> {
    fn clone(&self) -> Self {
        Self {
            connect: self.connect.clone(),
            disconnect: self.disconnect.clone(),
            messages: self.messages.clone(),
            fallback: self.fallback.clone(),
        }
    }
}

impl<C> ServiceHandlers<C>
where
    C: Send + Sync + 'static,
{
    /// Install the handlers into the node's own mux, bound to its descriptor.
    /// Returns whether anything was installed.
    fn wire(&self, node: &NetNode<C>) -> bool {
        let mux = node.client.mux();
        let mut wired = false;

        if let Some(handler) = self.connect.clone() {
            let peer = node.descriptor.clone();
            mux.connect_handler(move |conn| handler(peer.clone(), conn));
            wired = true;
        }

        if let Some(handler) = self.disconnect.clone() {
            let peer = node.descriptor.clone();
            mux.disconnect_handler(move |conn| handler(peer.clone(), conn));
            wired = true;
        }

        for (&(module_id, message_id), handler) in &self.messages {
            let handler = handler.clone();
            let peer = node.descriptor.clone();
            mux.message_handler(module_id, message_id, move |conn, frame| {
                handler(peer.clone(), conn, frame)
            });
            wired = true;
        }

        if let Some(handler) = self.fallback.clone() {
            let peer = node.descriptor.clone();
            mux.default_handler(move |conn, frame| handler(peer.clone(), conn, frame));
            wired = true;
        }

        wired
    }
}

/// RPC client for raw-socket peers.
///
/// Every admitted peer gets its own dialled `NetClient`. Handlers are
/// registered once per service and wired into each new peer's connection by
/// the dispatch loop run by `work()`, which then serves that connection.
/// Peers admitted before `work()` starts are held in a backlog and started
/// first.
pub struct NetRpcClient<C = RawCodec> {
    codec: C,
    options: ConnectionOptions,
    pool: NodePool<NetClient<C>>,
    handlers: RwLock<HashMap<String, ServiceHandlers<C>>>,
    queue: mpsc::Sender<(String, NetNode<C>)>,
    receiver: Mutex<Option<mpsc::Receiver<(String, NetNode<C>)>>>,
    backlog: Mutex<Option<Vec<(String, NetNode<C>)>>>,
    closed: CancellationToken,
}

impl<C> Default for NetRpcClient<C>
where
    C: Default + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(C::default())
    }
}

impl<C> NetRpcClient<C>
where
    C: Clone + Send + Sync + 'static,
{
    pub fn new(codec: C) -> Self {
        let (queue, receiver) = mpsc::channel(DISPATCH_QUEUE_CAPACITY);
        Self {
            codec,
            options: ConnectionOptions::default(),
            pool: NodePool::new(),
            handlers: RwLock::new(HashMap::new()),
            queue,
            receiver: Mutex::new(Some(receiver)),
            backlog: Mutex::new(Some(Vec::new())),
            closed: CancellationToken::new(),
        }
    }

    pub fn with_options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_local_node(mut self, local: Arc<dyn LocalNode>) -> Self {
        self.pool = self.pool.with_local_node(local);
        self
    }

    pub fn pool(&self) -> &NodePool<NetClient<C>> {
        &self.pool
    }

    pub fn connect_handler<F, Fut>(&self, service: &str, handler: F)
    where
        F: Fn(PeerDescriptor, Arc<Connection<C>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers
            .write()
            .entry(service.to_string())
            .or_default()
            .connect = Some(Arc::new(move |peer, conn| handler(peer, conn).boxed()));
    }

    pub fn disconnect_handler<F, Fut>(&self, service: &str, handler: F)
    where
        F: Fn(PeerDescriptor, Arc<Connection<C>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers
            .write()
            .entry(service.to_string())
            .or_default()
            .disconnect = Some(Arc::new(move |peer, conn| handler(peer, conn).boxed()));
    }

    pub fn message_handler<F, Fut>(&self, service: &str, module_id: u16, message_id: u16, handler: F)
    where
        F: Fn(PeerDescriptor, Arc<Connection<C>>, Frame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers
            .write()
            .entry(service.to_string())
            .or_default()
            .messages
            .insert(
                (module_id, message_id),
                Arc::new(move |peer, conn, frame| handler(peer, conn, frame).boxed()),
            );
    }

    pub fn default_handler<F, Fut>(&self, service: &str, handler: F)
    where
        F: Fn(PeerDescriptor, Arc<Connection<C>>, Frame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers
            .write()
            .entry(service.to_string())
            .or_default()
            .fallback = Some(Arc::new(move |peer, conn, frame| handler(peer, conn, frame).boxed()));
    }

    /// Reconcile the peers of `service` with a discovery event and queue the
    /// newly admitted ones for dispatch.
    pub async fn subscribe_callback(&self, service: &str, peers: Vec<PeerDescriptor>) {
        if self.closed.is_cancelled() {
            debug!("Client closed, ignoring update for {}", service);
            return;
        }

        let admitted = self
            .pool
            .reconcile(service, peers, |network| self.dial(network))
            .await;

        for node in admitted {
            self.enqueue(service, node).await;
        }
    }

    async fn dial(&self, network: ServiceNetwork) -> Result<NetClient<C>> {
        let mux = Arc::new(ConnMux::new(self.codec.clone()));
        let client = NetClient::new(network.network, network.address, mux)
            .with_options(self.options.clone());
        client.dial().await?;
        Ok(client)
    }

    async fn enqueue(&self, service: &str, node: NetNode<C>) {
        if self.closed.is_cancelled() {
            debug!(
                "Client closed, not dispatching node {}:{}",
                service,
                node.app_id()
            );
            return;
        }

        let item = (service.to_string(), node);
        if let Some(backlog) = self.backlog.lock().as_mut() {
            backlog.push(item);
            return;
        }

        tokio::select! {
            _ = self.closed.cancelled() => {
                debug!("Client closed while queueing node for {}", service);
            }
            sent = self.queue.send(item) => {
                if let Err(e) = sent {
                    debug!("Dispatch queue closed, dropping node {}:{}", e.0.0, e.0.1.app_id());
                }
            }
        }
    }

    /// Run the dispatch loop until `close()`.
    ///
    /// Nodes admitted before the loop started are started first; nodes still
    /// queued at close are started before returning.
    pub async fn work(&self) -> Result<()> {
        let mut receiver = self
            .receiver
            .lock()
            .take()
            .ok_or_else(|| MeshError::config("the dispatch loop is already running"))?;
        let backlog = self.backlog.lock().take().unwrap_or_default();
        if !backlog.is_empty() {
            debug!("Starting {} nodes admitted before the dispatch loop", backlog.len());
        }
        for (service, node) in backlog {
            self.start(&service, node);
        }

        loop {
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => break,
                item = receiver.recv() => match item {
                    Some((service, node)) => self.start(&service, node),
                    None => break,
                },
            }
        }

        receiver.close();
        while let Ok((service, node)) = receiver.try_recv() {
            self.start(&service, node);
        }

        debug!("Dispatch loop stopped");
        Ok(())
    }

    fn start(&self, service: &str, node: NetNode<C>) {
        let handlers = self.handlers.read().get(service).cloned();
        let Some(handlers) = handlers else {
            debug!("No handlers for service {}, node {} not served", service, node.app_id());
            return;
        };
        if !handlers.wire(&node) {
            return;
        }

        info!("Serving service node {}:{}", service, node.app_id());
        let service = service.to_string();
        tokio::spawn(async move {
            if let Err(e) = node.client.serve().await {
                warn!(
                    "Service node {}:{} stopped: {}",
                    service,
                    node.app_id(),
                    e
                );
            }
        });
    }

    /// Stop the dispatch loop and close every peer connection.
    pub async fn close(&self) {
        self.closed.cancel();
        self.pool.close_all().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub async fn all_send<T>(
        &self,
        service: &str,
        module_id: u16,
        message_id: u16,
        value: &T,
    ) -> Result<MultiResults<()>>
    where
        C: Codec<T>,
    {
        let nodes = select_nodes(&self.pool, service, None)?;
        self.nodes_send(nodes, module_id, message_id, value).await
    }

    pub async fn multi_send<T>(
        &self,
        service: &str,
        app_ids: &[u32],
        module_id: u16,
        message_id: u16,
        value: &T,
    ) -> Result<MultiResults<()>>
    where
        C: Codec<T>,
    {
        let nodes = select_nodes(&self.pool, service, Some(app_ids))?;
        self.nodes_send(nodes, module_id, message_id, value).await
    }

    pub async fn rand_send<T>(
        &self,
        service: &str,
        module_id: u16,
        message_id: u16,
        value: &T,
    ) -> Result<()>
    where
        C: Codec<T>,
    {
        let node = random_node(&self.pool, service)?;
        Ok(node.client.send(module_id, message_id, value).await?)
    }

    pub async fn app_id_send<T>(
        &self,
        service: &str,
        app_id: u32,
        module_id: u16,
        message_id: u16,
        value: &T,
    ) -> Result<()>
    where
        C: Codec<T>,
    {
        let node = app_id_node(&self.pool, service, app_id)?;
        Ok(node.client.send(module_id, message_id, value).await?)
    }

    /// Encode once and write the same body to every node concurrently.
    async fn nodes_send<T>(
        &self,
        nodes: Vec<NetNode<C>>,
        module_id: u16,
        message_id: u16,
        value: &T,
    ) -> Result<MultiResults<()>>
    where
        C: Codec<T>,
    {
        let body = self
            .codec
            .encode(value)
            .map_err(|e| MeshError::Codec(e.to_string()))?;
        let app_ids = nodes.iter().map(|node| node.app_id()).collect();

        let results = wait_all(nodes.into_iter().map(|node| {
            let body = body.clone();
            async move {
                node.client
                    .send_raw(module_id, message_id, &body)
                    .await
                    .map_err(MeshError::from)
            }
        }))
        .await;

        Ok(collect_results(app_ids, results))
    }

    /// Wait for one inbound frame from every node of `service`.
    pub async fn all_read(&self, service: &str) -> Result<MultiResults<Frame>> {
        let nodes = select_nodes(&self.pool, service, None)?;
        Ok(nodes_read(nodes).await)
    }

    pub async fn multi_read(&self, service: &str, app_ids: &[u32]) -> Result<MultiResults<Frame>> {
        let nodes = select_nodes(&self.pool, service, Some(app_ids))?;
        Ok(nodes_read(nodes).await)
    }

    /// First frame read without error from any node of `service`.
    ///
    /// Reads on the other nodes keep running; a frame they receive later is
    /// consumed and discarded.
    pub async fn any_read(&self, service: &str) -> Result<Frame> {
        let nodes = select_nodes(&self.pool, service, None)?;
        any_read(service, nodes).await
    }

    pub async fn any_of_multi_read(&self, service: &str, app_ids: &[u32]) -> Result<Frame> {
        let nodes = select_nodes(&self.pool, service, Some(app_ids))?;
        any_read(service, nodes).await
    }

    pub async fn rand_read(&self, service: &str) -> Result<Frame> {
        read_node(random_node(&self.pool, service)?).await
    }

    pub async fn app_id_read(&self, service: &str, app_id: u32) -> Result<Frame> {
        read_node(app_id_node(&self.pool, service, app_id)?).await
    }
}

#[async_trait]
impl<C> ServiceListener for NetRpcClient<C>
where
    C: Clone + Send + Sync + 'static,
{
    async fn on_change(&self, service: &str, peers: Vec<PeerDescriptor>) {
        self.subscribe_callback(service, peers).await;
    }
}

#[async_trait]
impl<C> PeerTransport for NetClient<C>
where
    C: Send + Sync + 'static,
{
    fn network(&self) -> &str {
        NetClient::network(self)
    }

    fn address(&self) -> &str {
        NetClient::address(self)
    }

    async fn close(&self) {
        match NetClient::close(self).await {
            Ok(()) | Err(WireError::NotConnected) => {}
            Err(e) => debug!("Closing {} failed: {}", NetClient::address(self), e),
        }
    }
}

async fn read_node<C>(node: NetNode<C>) -> Result<Frame>
where
    C: Send + Sync + 'static,
{
    match node.client.read().await? {
        Some(frame) => Ok(frame),
        None => Err(WireError::Closed.into()),
    }
}

async fn nodes_read<C>(nodes: Vec<NetNode<C>>) -> MultiResults<Frame>
where
    C: Send + Sync + 'static,
{
    let app_ids = nodes.iter().map(|node| node.app_id()).collect();
    let results = wait_all(nodes.into_iter().map(read_node)).await;
    collect_results(app_ids, results)
}

async fn any_read<C>(service: &str, nodes: Vec<NetNode<C>>) -> Result<Frame>
where
    C: Send + Sync + 'static,
{
    if nodes.is_empty() {
        return Err(unavailable(service));
    }
    Ok(wait_any_success(nodes.into_iter().map(read_node)).await?)
}

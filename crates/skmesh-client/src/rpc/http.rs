use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use skmesh_common::{LocalNode, PeerDescriptor, Reply, Result, wait_all};
use skmesh_discovery::ServiceListener;

use super::{app_id_node, collect_results, random_node, select_nodes};
use crate::http::{HttpClient, HttpClientConfig, encode_query};
use crate::pool::{NodePool, PeerNode};
use crate::result::MultiResults;

/// RPC client for peers speaking JSON over HTTP.
pub struct HttpRpcClient {
    config: HttpClientConfig,
    pool: NodePool<HttpClient>,
}

impl Default for HttpRpcClient {
    fn default() -> Self {
        Self::new(HttpClientConfig::default())
    }
}

impl HttpRpcClient {
    pub fn new(config: HttpClientConfig) -> Self {
        Self {
            config,
            pool: NodePool::new(),
        }
    }

    pub fn with_local_node(mut self, local: Arc<dyn LocalNode>) -> Self {
        self.pool = self.pool.with_local_node(local);
        self
    }

    pub fn pool(&self) -> &NodePool<HttpClient> {
        &self.pool
    }

    /// Reconcile the peers of `service` with a discovery event.
    pub async fn subscribe_callback(&self, service: &str, peers: Vec<PeerDescriptor>) {
        let config = &self.config;
        self.pool
            .reconcile(service, peers, |network| async move {
                HttpClient::new(&network.network, &network.address, config)
            })
            .await;
    }

    pub async fn close(&self) {
        self.pool.close_all().await;
    }

    pub async fn all_get<T, Q>(
        &self,
        service: &str,
        path: &str,
        query: &Q,
    ) -> Result<MultiResults<Reply<T>>>
    where
        T: DeserializeOwned + Send + 'static,
        Q: Serialize + ?Sized,
    {
        let nodes = select_nodes(&self.pool, service, None)?;
        nodes_get(nodes, path, encode_query(query)?).await
    }

    pub async fn multi_get<T, Q>(
        &self,
        service: &str,
        app_ids: &[u32],
        path: &str,
        query: &Q,
    ) -> Result<MultiResults<Reply<T>>>
    where
        T: DeserializeOwned + Send + 'static,
        Q: Serialize + ?Sized,
    {
        let nodes = select_nodes(&self.pool, service, Some(app_ids))?;
        nodes_get(nodes, path, encode_query(query)?).await
    }

    pub async fn rand_get<T, Q>(&self, service: &str, path: &str, query: &Q) -> Result<Reply<T>>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
    {
        random_node(&self.pool, service)?
            .client
            .get(path, query)
            .await
    }

    pub async fn app_id_get<T, Q>(
        &self,
        service: &str,
        app_id: u32,
        path: &str,
        query: &Q,
    ) -> Result<Reply<T>>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
    {
        app_id_node(&self.pool, service, app_id)?
            .client
            .get(path, query)
            .await
    }

    pub async fn all_post<T, Q, B>(
        &self,
        service: &str,
        path: &str,
        query: &Q,
        body: &B,
    ) -> Result<MultiResults<Reply<T>>>
    where
        T: DeserializeOwned + Send + 'static,
        Q: Serialize + ?Sized,
        B: Serialize + ?Sized,
    {
        let nodes = select_nodes(&self.pool, service, None)?;
        nodes_post(
            nodes,
            path,
            encode_query(query)?,
            serde_json::to_value(body)?,
        )
        .await
    }

    pub async fn multi_post<T, Q, B>(
        &self,
        service: &str,
        app_ids: &[u32],
        path: &str,
        query: &Q,
        body: &B,
    ) -> Result<MultiResults<Reply<T>>>
    where
        T: DeserializeOwned + Send + 'static,
        Q: Serialize + ?Sized,
        B: Serialize + ?Sized,
    {
        let nodes = select_nodes(&self.pool, service, Some(app_ids))?;
        nodes_post(
            nodes,
            path,
            encode_query(query)?,
            serde_json::to_value(body)?,
        )
        .await
    }

    pub async fn rand_post<T, Q, B>(
        &self,
        service: &str,
        path: &str,
        query: &Q,
        body: &B,
    ) -> Result<Reply<T>>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
        B: Serialize + ?Sized,
    {
        random_node(&self.pool, service)?
            .client
            .post(path, query, body)
            .await
    }

    pub async fn app_id_post<T, Q, B>(
        &self,
        service: &str,
        app_id: u32,
        path: &str,
        query: &Q,
        body: &B,
    ) -> Result<Reply<T>>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
        B: Serialize + ?Sized,
    {
        app_id_node(&self.pool, service, app_id)?
            .client
            .post(path, query, body)
            .await
    }
}

#[async_trait]
impl ServiceListener for HttpRpcClient {
    async fn on_change(&self, service: &str, peers: Vec<PeerDescriptor>) {
        self.subscribe_callback(service, peers).await;
    }
}

async fn nodes_get<T>(
    nodes: Vec<Arc<PeerNode<HttpClient>>>,
    path: &str,
    query: String,
) -> Result<MultiResults<Reply<T>>>
where
    T: DeserializeOwned + Send + 'static,
{
    let path: Arc<str> = Arc::from(path);
    let query: Arc<str> = Arc::from(query);
    let app_ids = nodes.iter().map(|node| node.app_id()).collect();

    let results = wait_all(nodes.into_iter().map(|node| {
        let path = path.clone();
        let query = query.clone();
        async move { node.client.get_encoded::<T>(&path, &query).await }
    }))
    .await;

    Ok(collect_results(app_ids, results))
}

async fn nodes_post<T>(
    nodes: Vec<Arc<PeerNode<HttpClient>>>,
    path: &str,
    query: String,
    body: Value,
) -> Result<MultiResults<Reply<T>>>
where
    T: DeserializeOwned + Send + 'static,
{
    let path: Arc<str> = Arc::from(path);
    let query: Arc<str> = Arc::from(query);
    let body = Arc::new(body);
    let app_ids = nodes.iter().map(|node| node.app_id()).collect();

    let results = wait_all(nodes.into_iter().map(|node| {
        let path = path.clone();
        let query = query.clone();
        let body = body.clone();
        async move {
            node.client
                .post_encoded::<T, Value>(&path, &query, &body)
                .await
        }
    }))
    .await;

    Ok(collect_results(app_ids, results))
}

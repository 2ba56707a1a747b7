//! Subscriber behavior against the in-memory coordination store

use std::sync::Arc;
use std::time::Duration;

use skmesh_common::{MeshError, PeerDescriptor, ServiceNetwork};
use skmesh_discovery::{
    CoordinationStore, DiscoveryConfig, FnServiceListener, MemoryStore, SessionState,
    StoreSession, Subscriber,
};
use tokio::sync::mpsc;

const NODES: &str = "/sk.org/server/orders/nodes";

type Update = (String, Vec<PeerDescriptor>);

fn subscriber(store: &MemoryStore) -> (Arc<Subscriber>, mpsc::UnboundedReceiver<Update>) {
    subscriber_with(store, None)
}

fn subscriber_with(
    store: &MemoryStore,
    local: Option<PeerDescriptor>,
) -> (Arc<Subscriber>, mpsc::UnboundedReceiver<Update>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut subscriber = Subscriber::new(
        DiscoveryConfig::with_servers(vec!["zk-1:2181".to_string()]),
        Arc::new(store.clone()),
    );
    if let Some(local) = local {
        subscriber = subscriber.with_local_node(Arc::new(local));
    }
    subscriber.add_subscribe(
        "orders",
        Arc::new(FnServiceListener::new(move |service: &str, peers| {
            let _ = tx.send((service.to_string(), peers));
        })),
    );
    subscriber.init().unwrap();
    (Arc::new(subscriber), rx)
}

fn peer(app_id: u32) -> PeerDescriptor {
    PeerDescriptor::new("orders", app_id)
        .with_inner(ServiceNetwork::new("tcp", format!("10.0.0.{}:9000", app_id)))
}

fn app_ids(peers: &[PeerDescriptor]) -> Vec<u32> {
    let mut ids: Vec<u32> = peers.iter().map(|p| p.app_id).collect();
    ids.sort_unstable();
    ids
}

#[tokio::test]
async fn test_init_requires_subscription() {
    let mut subscriber = Subscriber::new(
        DiscoveryConfig::with_servers(vec!["zk-1:2181".to_string()]),
        Arc::new(MemoryStore::new()),
    );
    assert!(matches!(subscriber.init(), Err(MeshError::Config(_))));
}

#[tokio::test]
async fn test_reports_every_change() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    store.put(NODES, b"")?;
    let (subscriber, mut updates) = subscriber(&store);
    let worker = {
        let subscriber = subscriber.clone();
        tokio::spawn(async move { subscriber.work().await })
    };

    let (service, peers) = updates.recv().await.unwrap();
    assert_eq!(service, "orders");
    assert!(peers.is_empty());

    let (owner, _events) = store
        .connect(&["zk-1:2181".to_string()], Duration::from_secs(30))
        .await?;
    owner
        .create_protected_ephemeral_sequential(
            &format!("{}/", NODES),
            &serde_json::to_vec(&peer(1))?,
        )
        .await?;
    let (_, peers) = updates.recv().await.unwrap();
    assert_eq!(app_ids(&peers), vec![1]);

    // Malformed and unprotected children are skipped.
    store.put(&format!("{}/_c_bad-0000000100", NODES), b"{not json")?;
    let (_, peers) = updates.recv().await.unwrap();
    assert_eq!(app_ids(&peers), vec![1]);
    store.put(&format!("{}/plain", NODES), &serde_json::to_vec(&peer(9))?)?;
    let (_, peers) = updates.recv().await.unwrap();
    assert_eq!(app_ids(&peers), vec![1]);

    owner
        .create_protected_ephemeral_sequential(
            &format!("{}/", NODES),
            &serde_json::to_vec(&peer(2))?,
        )
        .await?;
    let (_, peers) = updates.recv().await.unwrap();
    assert_eq!(app_ids(&peers), vec![1, 2]);

    // Ending the owning session removes both ephemeral nodes.
    owner.close().await;
    let (_, peers) = updates.recv().await.unwrap();
    assert!(peers.is_empty() || app_ids(&peers) == vec![2]);
    if !peers.is_empty() {
        let (_, peers) = updates.recv().await.unwrap();
        assert!(peers.is_empty());
    }

    subscriber.close();
    worker.await??;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_missing_node_list_is_retried() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let (subscriber, mut updates) = subscriber(&store);
    let start = tokio::time::Instant::now();
    let worker = {
        let subscriber = subscriber.clone();
        tokio::spawn(async move { subscriber.work().await })
    };

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(updates.try_recv().is_err());
    store.put(&format!("{}/_c_a-0000000000", NODES), &serde_json::to_vec(&peer(4))?)?;

    let (_, peers) = updates.recv().await.unwrap();
    assert_eq!(app_ids(&peers), vec![4]);
    assert!(start.elapsed() >= Duration::from_secs(10));

    subscriber.close();
    worker.await??;
    Ok(())
}

#[tokio::test]
async fn test_local_node_is_excluded() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    store.put(&format!("{}/_c_a-0000000000", NODES), &serde_json::to_vec(&peer(1))?)?;
    store.put(&format!("{}/_c_b-0000000001", NODES), &serde_json::to_vec(&peer(2))?)?;

    let (subscriber, mut updates) = subscriber_with(&store, Some(peer(1)));
    let worker = {
        let subscriber = subscriber.clone();
        tokio::spawn(async move { subscriber.work().await })
    };

    let (_, peers) = updates.recv().await.unwrap();
    assert_eq!(app_ids(&peers), vec![2]);

    subscriber.close();
    worker.await??;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_resubscribes_after_reconnect() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    store.put(&format!("{}/_c_a-0000000000", NODES), &serde_json::to_vec(&peer(1))?)?;
    let (subscriber, mut updates) = subscriber(&store);
    let worker = {
        let subscriber = subscriber.clone();
        tokio::spawn(async move { subscriber.work().await })
    };

    let (_, peers) = updates.recv().await.unwrap();
    assert_eq!(app_ids(&peers), vec![1]);

    store.broadcast(SessionState::Disconnected);
    let (_, peers) = tokio::time::timeout(Duration::from_secs(10), updates.recv())
        .await?
        .unwrap();
    assert_eq!(app_ids(&peers), vec![1]);

    subscriber.close();
    worker.await??;
    Ok(())
}

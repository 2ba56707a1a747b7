//! NetRpcClient against in-process raw-socket peers

use std::sync::Arc;
use std::time::Duration;

use skmesh_client::{DISPATCH_QUEUE_CAPACITY, NetRpcClient};
use skmesh_common::{MeshError, PeerDescriptor, ServiceNetwork};
use skmesh_wire::{ConnMux, Connection, ConnectionOptions, Frame, NetServer, RawCodec};
use tokio::sync::mpsc;

/// Start a server that answers frame (1, 1) with (1, 2) carrying
/// `"{app_id}:{body}"`.
async fn spawn_peer(app_id: u32) -> Arc<NetServer> {
    let mux: Arc<ConnMux> = Arc::new(ConnMux::default());
    mux.message_handler(1, 1, move |conn: Arc<Connection>, frame: Frame| async move {
        let reply = format!("{}:{}", app_id, String::from_utf8_lossy(&frame.body));
        let _ = conn.send_raw(1, 2, reply.as_bytes()).await;
    });

    let server = NetServer::bind("tcp", "127.0.0.1:0", mux, ConnectionOptions::default())
        .await
        .unwrap();
    let serving = server.clone();
    tokio::spawn(async move { serving.serve().await });
    server
}

fn peer(app_id: u32, server: &NetServer) -> PeerDescriptor {
    PeerDescriptor::new("orders", app_id)
        .with_inner(ServiceNetwork::new("tcp", server.local_address()))
}

fn body(frame: &Frame) -> String {
    String::from_utf8_lossy(&frame.body).into_owned()
}

#[tokio::test]
async fn test_all_send_and_all_read() -> anyhow::Result<()> {
    let first = spawn_peer(1).await;
    let second = spawn_peer(2).await;
    let client = NetRpcClient::new(RawCodec);
    client
        .subscribe_callback("orders", vec![peer(1, &first), peer(2, &second)])
        .await;

    let sent = client.all_send("orders", 1, 1, &"ping".to_string()).await?;
    assert_eq!(sent.len(), 2);
    assert!(sent.values().all(|r| r.is_ok()));

    let frames = client.all_read("orders").await?;
    assert_eq!(frames.len(), 2);
    assert_eq!(body(frames[&1].result().unwrap()), "1:ping");
    assert_eq!(body(frames[&2].result().unwrap()), "2:ping");

    client.close().await;
    first.close().await;
    second.close().await;
    Ok(())
}

#[tokio::test]
async fn test_call_by_id_after_removal() -> anyhow::Result<()> {
    let first = spawn_peer(1).await;
    let second = spawn_peer(2).await;
    let client = NetRpcClient::new(RawCodec);
    client
        .subscribe_callback("orders", vec![peer(1, &first), peer(2, &second)])
        .await;

    client
        .app_id_send("orders", 2, 1, 1, &"hello".to_string())
        .await?;
    assert_eq!(body(&client.app_id_read("orders", 2).await?), "2:hello");

    let removed = client.pool().node("orders", 2).unwrap().client.clone();
    client
        .subscribe_callback("orders", vec![peer(1, &first)])
        .await;

    let err = client
        .app_id_send("orders", 2, 1, 1, &"hello".to_string())
        .await
        .unwrap_err();
    assert!(err.is_node_unavailable());
    assert!(removed.connection()?.is_closed());

    client.close().await;
    first.close().await;
    second.close().await;
    Ok(())
}

#[tokio::test]
async fn test_reads_race_across_a_subset() -> anyhow::Result<()> {
    let first = spawn_peer(1).await;
    let second = spawn_peer(2).await;
    let client = NetRpcClient::new(RawCodec);
    client
        .subscribe_callback("orders", vec![peer(1, &first), peer(2, &second)])
        .await;

    let sent = client
        .multi_send("orders", &[2, 9], 1, 1, &"pick".to_string())
        .await?;
    assert_eq!(sent.keys().copied().collect::<Vec<_>>(), vec![2]);

    let frame = client.any_of_multi_read("orders", &[2, 9]).await?;
    assert_eq!(body(&frame), "2:pick");

    let err = client.any_of_multi_read("orders", &[9]).await.unwrap_err();
    assert!(err.is_node_unavailable());

    client.rand_send("orders", 1, 1, &"any".to_string()).await?;
    let frame = client.any_read("orders").await?;
    assert!(body(&frame).ends_with(":any"));

    client.close().await;
    first.close().await;
    second.close().await;
    Ok(())
}

#[tokio::test]
async fn test_absent_service_is_unavailable() {
    let client = NetRpcClient::new(RawCodec);

    let err = client.all_read("billing").await.unwrap_err();
    assert!(matches!(err, MeshError::NodeUnavailable(_)));
    let err = client.rand_read("billing").await.unwrap_err();
    assert!(err.is_node_unavailable());
    let err = client
        .all_send("billing", 1, 1, &"x".to_string())
        .await
        .unwrap_err();
    assert!(err.is_node_unavailable());
}

#[tokio::test]
async fn test_dispatch_loop_serves_new_nodes() -> anyhow::Result<()> {
    let server = spawn_peer(3).await;
    let client = Arc::new(NetRpcClient::new(RawCodec));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let connects = tx.clone();
    client.connect_handler("orders", move |peer: PeerDescriptor, _conn| {
        let connects = connects.clone();
        async move {
            let _ = connects.send((peer.app_id, "connected".to_string()));
        }
    });
    client.message_handler("orders", 1, 2, move |peer: PeerDescriptor, _conn, frame: Frame| {
        let tx = tx.clone();
        async move {
            let _ = tx.send((peer.app_id, body(&frame)));
        }
    });

    let worker = {
        let client = client.clone();
        tokio::spawn(async move { client.work().await })
    };

    client
        .subscribe_callback("orders", vec![peer(3, &server)])
        .await;
    assert_eq!(rx.recv().await, Some((3, "connected".to_string())));

    client
        .app_id_send("orders", 3, 1, 1, &"via loop".to_string())
        .await?;
    assert_eq!(rx.recv().await, Some((3, "3:via loop".to_string())));

    client.close().await;
    worker.await??;

    // Admissions after close are dropped without blocking.
    let late = spawn_peer(4).await;
    tokio::time::timeout(
        Duration::from_secs(5),
        client.subscribe_callback("orders", vec![peer(4, &late)]),
    )
    .await?;

    assert!(matches!(client.work().await, Err(MeshError::Config(_))));
    server.close().await;
    late.close().await;
    Ok(())
}

#[tokio::test]
async fn test_nodes_admitted_before_work_are_all_served() -> anyhow::Result<()> {
    let count = DISPATCH_QUEUE_CAPACITY as u32 + 2;
    let mut servers = Vec::new();
    for app_id in 1..=count {
        servers.push(spawn_peer(app_id).await);
    }

    let client = Arc::new(NetRpcClient::new(RawCodec));
    let (tx, mut rx) = mpsc::unbounded_channel();
    client.connect_handler("orders", move |peer: PeerDescriptor, _conn| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(peer.app_id);
        }
    });

    let peers = servers
        .iter()
        .zip(1..=count)
        .map(|(server, app_id)| peer(app_id, server))
        .collect();
    client.subscribe_callback("orders", peers).await;
    assert_eq!(client.pool().nodes("orders").unwrap().len(), count as usize);

    let worker = {
        let client = client.clone();
        tokio::spawn(async move { client.work().await })
    };

    let mut served = Vec::new();
    while served.len() < count as usize {
        let app_id = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await?
            .expect("connect handler channel open");
        served.push(app_id);
    }
    served.sort_unstable();
    assert_eq!(served, (1..=count).collect::<Vec<_>>());

    client.close().await;
    worker.await??;
    for server in servers {
        server.close().await;
    }
    Ok(())
}

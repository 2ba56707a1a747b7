//! Frames over WebSocket, one binary message per frame

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use skmesh_wire::{ConnMux, Connection, Frame, WebSocketTransport, WireError, WsClient};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// Accept WebSocket peers and serve each with a mux that answers (1, 1)
/// with (1, 2) carrying `"echo:{body}"`. Disconnects are reported on the
/// returned channel.
async fn spawn_echo_server() -> (String, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = format!("ws://{}", listener.local_addr().unwrap());
    let (tx, rx) = mpsc::unbounded_channel();

    let mux: Arc<ConnMux> = Arc::new(ConnMux::default());
    mux.message_handler(1, 1, |conn: Arc<Connection>, frame: Frame| async move {
        let reply = format!("echo:{}", String::from_utf8_lossy(&frame.body));
        let _ = conn.send_raw(1, 2, reply.as_bytes()).await;
    });
    mux.disconnect_handler(move |conn: Arc<Connection>| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(conn.remote_address().to_string());
        }
    });

    tokio::spawn(async move {
        while let Ok((stream, peer)) = listener.accept().await {
            let mux = mux.clone();
            tokio::spawn(async move {
                let ws = tokio_tungstenite::accept_async(stream).await?;
                let conn = Connection::new(WebSocketTransport::new(ws, "server", peer.to_string()), mux);
                conn.serve().await
            });
        }
    });

    (address, rx)
}

#[tokio::test]
async fn test_ws_client_round_trip() -> anyhow::Result<()> {
    let (address, mut disconnects) = spawn_echo_server().await;

    let client: WsClient = WsClient::new(address, Arc::new(ConnMux::default()));
    let conn = client.dial("/ws").await?;
    assert!(!conn.remote_address().is_empty());

    client.send(1, 1, &"first".to_string()).await?;
    client.send_raw(1, 1, b"second").await?;

    let frame = client.read().await?.expect("first reply");
    assert_eq!(frame.key(), (1, 2));
    assert_eq!(frame.body.as_ref(), b"echo:first");
    let frame = client.read().await?.expect("second reply");
    assert_eq!(frame.body.as_ref(), b"echo:second");

    client.close().await?;
    assert!(disconnects.recv().await.is_some());
    Ok(())
}

#[tokio::test]
async fn test_each_frame_is_one_binary_message() -> anyhow::Result<()> {
    let (address, _disconnects) = spawn_echo_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("{}/raw", address)).await?;

    ws.send(Message::binary(Frame::new(1, 1, "a").encode()?)).await?;
    ws.send(Message::binary(Frame::new(1, 1, "bc").encode()?)).await?;

    for expected in ["echo:a", "echo:bc"] {
        let message = ws.next().await.expect("reply message")?;
        let Message::Binary(data) = message else {
            panic!("expected a binary message, got {:?}", message);
        };
        let frame = Frame::decode(&data)?;
        assert_eq!(frame.key(), (1, 2));
        assert_eq!(frame.body.as_ref(), expected.as_bytes());
    }
    Ok(())
}

#[tokio::test]
async fn test_message_with_trailing_bytes_ends_the_connection() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let address = format!("ws://{}", listener.local_addr()?);
    let serving = tokio::spawn(async move {
        let (stream, _) = listener.accept().await?;
        let ws = tokio_tungstenite::accept_async(stream).await?;
        let conn: Arc<Connection> =
            Connection::new(WebSocketTransport::new(ws, "server", "client"), Arc::new(ConnMux::default()));
        anyhow::Ok(conn.serve().await)
    });

    let (mut ws, _) = tokio_tungstenite::connect_async(address).await?;
    let mut buf = Frame::new(1, 1, "abc").encode()?.to_vec();
    buf.extend_from_slice(b"zz");
    ws.send(Message::binary(buf)).await?;

    let result = serving.await??;
    assert!(matches!(
        result,
        Err(WireError::TrailingBytes { expected: 3, actual: 5 })
    ));
    Ok(())
}

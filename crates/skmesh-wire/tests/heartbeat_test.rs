//! Heartbeat watchdog timing, on paused tokio time

use std::sync::Arc;
use std::time::Duration;

use skmesh_wire::{ConnMux, Connection, StreamTransport};
use tokio::io::duplex;
use tokio::time::Instant;

fn connection() -> (Arc<Connection>, tokio::io::DuplexStream) {
    let (a, b) = duplex(1024);
    let conn = Connection::new(
        StreamTransport::new(a, "local", "remote"),
        Arc::new(ConnMux::default()),
    );
    (conn, b)
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_closes_silent_connection() {
    let (conn, _peer) = connection();
    let start = Instant::now();
    conn.beating(0, 1, Duration::from_secs(5));

    tokio::time::sleep(Duration::from_millis(5500)).await;
    assert!(!conn.is_closed());

    conn.closed().await;
    let elapsed = start.elapsed();
    assert!(elapsed > Duration::from_secs(5), "closed too early: {:?}", elapsed);
    assert!(elapsed <= Duration::from_secs(7), "closed too late: {:?}", elapsed);
}

#[tokio::test(start_paused = true)]
async fn test_beats_keep_connection_alive() {
    let (conn, _peer) = connection();
    conn.beating(0, 1, Duration::from_secs(5));

    for _ in 0..10 {
        tokio::time::sleep(Duration::from_secs(2)).await;
        conn.beat_now();
    }
    assert!(!conn.is_closed());

    let silent_from = Instant::now();
    conn.closed().await;
    let elapsed = silent_from.elapsed();
    assert!(elapsed > Duration::from_secs(5));
    assert!(elapsed <= Duration::from_secs(7));
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_stops_after_close() {
    let (conn, _peer) = connection();
    conn.beating(0, 1, Duration::from_secs(1));
    conn.close().await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(conn.is_closed());
    assert_eq!(Arc::strong_count(&conn), 1);
}

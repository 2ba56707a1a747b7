//! One framed duplex connection
//!
//! Sends are serialized by the write-half lock and go out as a single
//! header+body write. Reads are sequential under the read-half lock and are
//! interrupted by `close()` from any task.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::codec::{Codec, RawCodec};
use crate::error::{Result, WireError};
use crate::frame::{self, Frame};
use crate::mux::ConnMux;
use crate::transport::{BoxFrameSink, BoxFrameSource, FrameTransport};

/// Upper bound on a frame body accepted by `read()`
pub const DEFAULT_MAX_BODY_LEN: usize = 64 * 1024 * 1024;
/// Timeout for establishing raw-socket connections
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

const WATCHDOG_TICK: Duration = Duration::from_secs(1);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    pub max_body_len: usize,
    pub connect_timeout_ms: u64,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            max_body_len: DEFAULT_MAX_BODY_LEN,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

impl ConnectionOptions {
    pub fn with_max_body_len(mut self, max_body_len: usize) -> Self {
        self.max_body_len = max_body_len;
        self
    }

    pub fn with_connect_timeout_ms(mut self, connect_timeout_ms: u64) -> Self {
        self.connect_timeout_ms = connect_timeout_ms;
        self
    }
}

struct Heartbeat {
    armed: bool,
    last_beat: Instant,
    period: Duration,
    module_id: u16,
    message_id: u16,
}

pub struct Connection<C = RawCodec> {
    id: u64,
    local_address: String,
    remote_address: String,
    reader: Mutex<BoxFrameSource>,
    writer: Mutex<BoxFrameSink>,
    mux: Arc<ConnMux<C>>,
    max_body_len: usize,
    closed: CancellationToken,
    closing: AtomicBool,
    serving: AtomicBool,
    object: parking_lot::RwLock<Option<Weak<dyn Any + Send + Sync>>>,
    heartbeat: parking_lot::Mutex<Heartbeat>,
}

impl<C> Connection<C>
where
    C: Send + Sync + 'static,
{
    pub fn new<T: FrameTransport>(transport: T, mux: Arc<ConnMux<C>>) -> Arc<Self> {
        Self::with_options(transport, mux, &ConnectionOptions::default())
    }

    pub fn with_options<T: FrameTransport>(
        transport: T,
        mux: Arc<ConnMux<C>>,
        options: &ConnectionOptions,
    ) -> Arc<Self> {
        let local_address = transport.local_address();
        let remote_address = transport.remote_address();
        let (reader, writer) = transport.split_halves();

        Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            local_address,
            remote_address,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            mux,
            max_body_len: options.max_body_len,
            closed: CancellationToken::new(),
            closing: AtomicBool::new(false),
            serving: AtomicBool::new(false),
            object: parking_lot::RwLock::new(None),
            heartbeat: parking_lot::Mutex::new(Heartbeat {
                armed: false,
                last_beat: Instant::now(),
                period: Duration::ZERO,
                module_id: 0,
                message_id: 0,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    pub fn mux(&self) -> &Arc<ConnMux<C>> {
        &self.mux
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Encode `value` with the connection codec and send it as one frame.
    pub async fn send<T>(&self, module_id: u16, message_id: u16, value: &T) -> Result<()>
    where
        C: Codec<T>,
    {
        let body = self.mux.codec().encode(value)?;
        self.write_frame(module_id, message_id, &body).await
    }

    /// Send an already-encoded body.
    pub async fn send_raw(&self, module_id: u16, message_id: u16, body: &[u8]) -> Result<()> {
        self.write_frame(module_id, message_id, body).await
    }

    pub async fn send_empty(&self, module_id: u16, message_id: u16) -> Result<()> {
        self.write_frame(module_id, message_id, &[]).await
    }

    /// Decode a frame body with the connection codec.
    pub fn decode<T>(&self, frame: &Frame) -> Result<T>
    where
        C: Codec<T>,
    {
        Ok(self.mux.codec().decode(&frame.body)?)
    }

    async fn write_frame(&self, module_id: u16, message_id: u16, body: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(WireError::Closed);
        }

        let buf = frame::encode_frame(module_id, message_id, body)?;
        let mut writer = self.writer.lock().await;

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(WireError::Closed),
            result = writer.send_frame(buf) => result,
        }
    }

    /// Read the next frame.
    ///
    /// `Ok(None)` means the peer ended the stream cleanly between frames.
    pub async fn read(&self) -> Result<Option<Frame>> {
        let mut reader = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(WireError::Closed),
            guard = self.reader.lock() => guard,
        };

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(WireError::Closed),
            result = reader.next_frame(self.max_body_len) => result,
        }
    }

    /// Close the connection. Safe to call any number of times from any task.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }

        self.closed.cancel();

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("Connection {} shutdown: {}", self.id, e);
        }
        debug!("Connection {} closed ({})", self.id, self.remote_address);
    }

    /// Run the connect handler, dispatch frames until the stream ends or the
    /// connection is closed, then run the disconnect handler once and close.
    ///
    /// A panicking handler is logged and ends the loop the same way.
    pub async fn serve(self: &Arc<Self>) -> Result<()> {
        if self.serving.swap(true, Ordering::AcqRel) {
            return Err(WireError::AlreadyServing);
        }

        let result = match AssertUnwindSafe(self.serve_loop()).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                error!("Connection {} handler panicked: {}", self.id, msg);
                Err(WireError::HandlerPanicked(msg))
            }
        };

        if let Err(panic) = AssertUnwindSafe(self.mux.handle_disconnect(self))
            .catch_unwind()
            .await
        {
            error!(
                "Connection {} disconnect handler panicked: {}",
                self.id,
                panic_message(panic.as_ref())
            );
        }

        self.close().await;
        result
    }

    async fn serve_loop(self: &Arc<Self>) -> Result<()> {
        self.mux.handle_connect(self).await;

        loop {
            match self.read().await {
                Ok(Some(frame)) => {
                    if !self.is_heartbeat(&frame) {
                        debug!(
                            "Connection {} received frame {}:{} ({} bytes)",
                            self.id,
                            frame.module_id,
                            frame.message_id,
                            frame.body_len()
                        );
                    }
                    self.mux.handle_message(self, frame).await;
                }
                Ok(None) => {
                    debug!("Connection {} reached end of stream", self.id);
                    return Ok(());
                }
                Err(_) if self.is_closed() => return Ok(()),
                Err(e) => {
                    error!("Connection {} read failed: {}", self.id, e);
                    return Err(e);
                }
            }
        }
    }

    /// Arm the heartbeat watchdog.
    ///
    /// Frames keyed `(module_id, message_id)` are treated as heartbeats. Once
    /// armed, the connection is closed when no `beat()` has been recorded
    /// for longer than `period`. Arming again only updates the parameters.
    pub fn beating(self: &Arc<Self>, module_id: u16, message_id: u16, period: Duration) {
        {
            let mut heartbeat = self.heartbeat.lock();
            heartbeat.module_id = module_id;
            heartbeat.message_id = message_id;
            heartbeat.period = period;
            heartbeat.last_beat = Instant::now();
            if heartbeat.armed {
                return;
            }
            heartbeat.armed = true;
        }

        let conn = Arc::downgrade(self);
        let closed = self.closed.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + WATCHDOG_TICK, WATCHDOG_TICK);
            loop {
                let now = tokio::select! {
                    _ = closed.cancelled() => break,
                    now = ticker.tick() => now,
                };

                let Some(conn) = conn.upgrade() else { break };
                let (last_beat, period) = {
                    let heartbeat = conn.heartbeat.lock();
                    (heartbeat.last_beat, heartbeat.period)
                };

                if now.saturating_duration_since(last_beat) > period {
                    warn!(
                        "Connection {} missed heartbeat for {:?}, closing",
                        conn.id, period
                    );
                    conn.close().await;
                    break;
                }
            }
        });
    }

    /// Record a heartbeat at `now`.
    pub fn beat(&self, now: Instant) {
        self.heartbeat.lock().last_beat = now;
    }

    pub fn beat_now(&self) {
        self.beat(Instant::now());
    }

    pub fn is_heartbeat(&self, frame: &Frame) -> bool {
        let heartbeat = self.heartbeat.lock();
        heartbeat.armed && frame.key() == (heartbeat.module_id, heartbeat.message_id)
    }

    /// Attach an application object (a session, a player). Only a weak
    /// reference is kept.
    pub fn bind_object<T>(&self, object: &Arc<T>)
    where
        T: Any + Send + Sync,
    {
        let weak: Weak<dyn Any + Send + Sync> = Arc::downgrade(object) as Weak<dyn Any + Send + Sync>;
        *self.object.write() = Some(weak);
    }

    /// The bound object, if it is still alive and of type `T`.
    pub fn object<T>(&self) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let object = self.object.read().as_ref()?.upgrade()?;
        object.downcast::<T>().ok()
    }

    pub fn clear_object(&self) {
        *self.object.write() = None;
    }
}

impl<C> std::fmt::Debug for Connection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("local_address", &self.local_address)
            .field("remote_address", &self.remote_address)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;
    use crate::transport::StreamTransport;

    fn pair() -> (Arc<Connection>, Arc<Connection>) {
        let (a, b) = duplex(64 * 1024);
        let mux = Arc::new(ConnMux::default());
        (
            Connection::new(StreamTransport::new(a, "a", "b"), mux.clone()),
            Connection::new(StreamTransport::new(b, "b", "a"), mux),
        )
    }

    #[tokio::test]
    async fn test_send_then_read() {
        let (a, b) = pair();
        a.send(1, 2, &"hello".to_string()).await.unwrap();
        a.send_empty(1, 3).await.unwrap();

        let frame = b.read().await.unwrap().unwrap();
        assert_eq!(frame.key(), (1, 2));
        assert_eq!(b.decode::<String>(&frame).unwrap(), "hello");

        let frame = b.read().await.unwrap().unwrap();
        assert_eq!(frame.key(), (1, 3));
        assert_eq!(frame.body_len(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_interrupts_read() {
        let (a, _b) = pair();
        let reader = a.clone();
        let pending = tokio::spawn(async move { reader.read().await });

        tokio::task::yield_now().await;
        a.close().await;
        a.close().await;

        assert!(matches!(pending.await.unwrap(), Err(WireError::Closed)));
        assert!(a.is_closed());
        assert!(matches!(a.send_empty(1, 1).await, Err(WireError::Closed)));
    }

    #[tokio::test]
    async fn test_peer_close_is_end_of_stream() {
        let (a, b) = pair();
        a.close().await;
        assert!(b.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bound_object_is_weak() {
        let (a, _b) = pair();
        let session = Arc::new("player-7".to_string());
        a.bind_object(&session);

        assert_eq!(a.object::<String>().as_deref(), Some(&"player-7".to_string()));
        assert!(a.object::<u32>().is_none());

        drop(session);
        assert!(a.object::<String>().is_none());
    }

    #[tokio::test]
    async fn test_is_heartbeat_requires_armed_watchdog() {
        let (a, _b) = pair();
        let frame = Frame::new(0, 1, bytes::Bytes::new());
        assert!(!a.is_heartbeat(&frame));

        a.beating(0, 1, Duration::from_secs(30));
        assert!(a.is_heartbeat(&frame));
        assert!(!a.is_heartbeat(&Frame::new(0, 2, bytes::Bytes::new())));
    }
}

//! WebSocket substrate and client
//!
//! Every frame travels as one binary message holding header and body, so
//! the header length always matches the message length. Text messages are
//! decoded the same way; ping and pong are answered by the protocol layer
//! and never reach the mux.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use url::Url;

use crate::codec::{Codec, RawCodec};
use crate::connection::{Connection, ConnectionOptions};
use crate::error::{Result, WireError};
use crate::frame::{Frame, HEADER_LEN};
use crate::mux::ConnMux;
use crate::transport::{BoxFrameSink, BoxFrameSource, FrameSink, FrameSource, FrameTransport};

/// A WebSocket stream carrying one frame per message.
pub struct WebSocketTransport<S> {
    stream: WebSocketStream<S>,
    local: String,
    remote: String,
}

impl<S> WebSocketTransport<S> {
    pub fn new(stream: WebSocketStream<S>, local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            stream,
            local: local.into(),
            remote: remote.into(),
        }
    }
}

impl<S> FrameTransport for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    fn local_address(&self) -> String {
        self.local.clone()
    }

    fn remote_address(&self) -> String {
        self.remote.clone()
    }

    fn split_halves(self) -> (BoxFrameSource, BoxFrameSink) {
        let (sink, stream) = self.stream.split();
        (
            Box::new(MessageSource { stream }),
            Box::new(MessageSink { sink }),
        )
    }
}

struct MessageSource<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S> FrameSource for MessageSource<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    async fn next_frame(&mut self, max_body_len: usize) -> Result<Option<Frame>> {
        loop {
            let message = match self.stream.next().await {
                None => return Ok(None),
                Some(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed)) => {
                    return Ok(None);
                }
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(message)) => message,
            };

            match message {
                Message::Binary(data) => return decode_message(&data, max_body_len).map(Some),
                Message::Text(text) => {
                    return decode_message(text.as_bytes(), max_body_len).map(Some);
                }
                Message::Close(_) => return Ok(None),
                _ => continue,
            }
        }
    }
}

fn decode_message(buf: &[u8], max_body_len: usize) -> Result<Frame> {
    let body_len = buf.len().saturating_sub(HEADER_LEN);
    if body_len > max_body_len {
        return Err(WireError::FrameTooLarge {
            len: body_len,
            max: max_body_len,
        });
    }
    Frame::decode(buf)
}

struct MessageSink<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

#[async_trait]
impl<S> FrameSink for MessageSink<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    async fn send_frame(&mut self, buf: Bytes) -> Result<()> {
        self.sink.send(Message::binary(buf)).await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.sink.close().await?;
        Ok(())
    }
}

/// Client for one WebSocket peer. `address` is the `ws://` or `wss://` base
/// URL; `dial(path)` connects to that path on it.
pub struct WsClient<C = RawCodec> {
    address: String,
    options: ConnectionOptions,
    mux: Arc<ConnMux<C>>,
    conn: RwLock<Option<Arc<Connection<C>>>>,
}

impl<C> WsClient<C>
where
    C: Send + Sync + 'static,
{
    pub fn new(address: impl Into<String>, mux: Arc<ConnMux<C>>) -> Self {
        Self {
            address: address.into(),
            options: ConnectionOptions::default(),
            mux,
            conn: RwLock::new(None),
        }
    }

    pub fn with_options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn mux(&self) -> &Arc<ConnMux<C>> {
        &self.mux
    }

    /// URL of `path` on the configured base address.
    pub fn url(&self, path: &str) -> Result<Url> {
        if self.address.is_empty() {
            return Err(WireError::Config("'address' cannot be empty".to_string()));
        }

        let mut url = Url::parse(&self.address)
            .map_err(|e| WireError::Config(format!("invalid address '{}': {}", self.address, e)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(WireError::Config(format!(
                "scheme '{}' is not supported, expected ws or wss",
                url.scheme()
            )));
        }
        url.set_path(path);
        Ok(url)
    }

    /// Connect to `path`, replacing (and closing) any earlier connection.
    pub async fn dial(&self, path: &str) -> Result<Arc<Connection<C>>> {
        let url = self.url(path)?;
        let timeout = Duration::from_millis(self.options.connect_timeout_ms);

        let (stream, _) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url.as_str()))
            .await
            .map_err(|_| WireError::ConnectTimeout(url.to_string()))??;

        let (local, remote) = match stream.get_ref() {
            MaybeTlsStream::Plain(tcp) => (
                tcp.local_addr().map(|a| a.to_string()).unwrap_or_default(),
                tcp.peer_addr().map(|a| a.to_string()).unwrap_or_default(),
            ),
            _ => (String::new(), url.to_string()),
        };

        let conn = Connection::with_options(
            WebSocketTransport::new(stream, local, remote),
            self.mux.clone(),
            &self.options,
        );
        info!("Connected to {}", url);

        let previous = self.conn.write().replace(conn.clone());
        if let Some(previous) = previous {
            debug!("Replacing connection {} to {}", previous.id(), url);
            previous.close().await;
        }

        Ok(conn)
    }

    pub fn connection(&self) -> Result<Arc<Connection<C>>> {
        self.conn.read().clone().ok_or(WireError::NotConnected)
    }

    pub async fn send<T>(&self, module_id: u16, message_id: u16, value: &T) -> Result<()>
    where
        C: Codec<T>,
    {
        self.connection()?.send(module_id, message_id, value).await
    }

    pub async fn send_raw(&self, module_id: u16, message_id: u16, body: &[u8]) -> Result<()> {
        self.connection()?.send_raw(module_id, message_id, body).await
    }

    pub async fn send_empty(&self, module_id: u16, message_id: u16) -> Result<()> {
        self.connection()?.send_empty(module_id, message_id).await
    }

    pub async fn read(&self) -> Result<Option<Frame>> {
        self.connection()?.read().await
    }

    pub async fn serve(&self) -> Result<()> {
        self.connection()?.serve().await
    }

    pub async fn close(&self) -> Result<()> {
        self.connection()?.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(address: &str) -> WsClient {
        WsClient::new(address, Arc::new(ConnMux::default()))
    }

    #[test]
    fn test_url_replaces_path() {
        let url = client("ws://127.0.0.1:9000/old").url("/game").unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:9000/game");
    }

    #[test]
    fn test_url_rejects_bad_addresses() {
        assert!(matches!(client("").url("/ws"), Err(WireError::Config(_))));
        assert!(matches!(
            client("http://127.0.0.1:9000").url("/ws"),
            Err(WireError::Config(msg)) if msg.contains("scheme 'http'")
        ));
        assert!(matches!(client("not a url").url("/ws"), Err(WireError::Config(_))));
    }

    #[test]
    fn test_oversized_message_is_rejected() {
        let buf = Frame::new(1, 1, vec![0u8; 32]).encode().unwrap();
        assert!(matches!(
            decode_message(&buf, 16),
            Err(WireError::FrameTooLarge { len: 32, max: 16 })
        ));
        assert_eq!(decode_message(&buf, 32).unwrap().body_len(), 32);
    }

    #[tokio::test]
    async fn test_operations_before_dial_are_not_connected() {
        let client = client("ws://127.0.0.1:9000");
        assert!(matches!(client.send_empty(1, 1).await, Err(WireError::NotConnected)));
        assert!(matches!(client.read().await, Err(WireError::NotConnected)));
        assert!(matches!(client.close().await, Err(WireError::NotConnected)));
    }
}

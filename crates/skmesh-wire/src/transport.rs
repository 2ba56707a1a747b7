//! Substrates a `Connection` can run over
//!
//! A transport splits into a frame source and a frame sink. Byte streams
//! (TCP, Unix sockets, in-memory duplex pipes) recover frame boundaries from
//! the header; message-oriented transports carry one frame per message.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::Result;
use crate::frame::{self, Frame};

pub type BoxFrameSource = Box<dyn FrameSource>;
pub type BoxFrameSink = Box<dyn FrameSink>;

/// Read half of a transport.
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame, or `Ok(None)` when the peer ended the stream between
    /// frames.
    async fn next_frame(&mut self, max_body_len: usize) -> Result<Option<Frame>>;
}

/// Write half of a transport.
#[async_trait]
pub trait FrameSink: Send {
    /// Write one encoded frame (header and body) as a unit.
    async fn send_frame(&mut self, buf: Bytes) -> Result<()>;

    async fn shutdown(&mut self) -> Result<()>;
}

pub trait FrameTransport: Send + 'static {
    fn local_address(&self) -> String;
    fn remote_address(&self) -> String;
    fn split_halves(self) -> (BoxFrameSource, BoxFrameSink);
}

/// Frame source over an ordered byte stream.
pub struct ByteSource<R> {
    reader: R,
}

impl<R> ByteSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

#[async_trait]
impl<R> FrameSource for ByteSource<R>
where
    R: AsyncRead + Send + Unpin,
{
    async fn next_frame(&mut self, max_body_len: usize) -> Result<Option<Frame>> {
        frame::read_frame(&mut self.reader, max_body_len).await
    }
}

/// Frame sink over an ordered byte stream.
pub struct ByteSink<W> {
    writer: W,
}

impl<W> ByteSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl<W> FrameSink for ByteSink<W>
where
    W: AsyncWrite + Send + Unpin,
{
    async fn send_frame(&mut self, buf: Bytes) -> Result<()> {
        self.writer.write_all(&buf).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

fn byte_halves<R, W>(reader: R, writer: W) -> (BoxFrameSource, BoxFrameSink)
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    (
        Box::new(ByteSource::new(reader)),
        Box::new(ByteSink::new(writer)),
    )
}

impl FrameTransport for TcpStream {
    fn local_address(&self) -> String {
        self.local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default()
    }

    fn remote_address(&self) -> String {
        self.peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default()
    }

    fn split_halves(self) -> (BoxFrameSource, BoxFrameSink) {
        let (reader, writer) = self.into_split();
        byte_halves(reader, writer)
    }
}

#[cfg(unix)]
impl FrameTransport for tokio::net::UnixStream {
    fn local_address(&self) -> String {
        unix_label(self.local_addr().ok())
    }

    fn remote_address(&self) -> String {
        unix_label(self.peer_addr().ok())
    }

    fn split_halves(self) -> (BoxFrameSource, BoxFrameSink) {
        let (reader, writer) = self.into_split();
        byte_halves(reader, writer)
    }
}

#[cfg(unix)]
fn unix_label(addr: Option<tokio::net::unix::SocketAddr>) -> String {
    addr.and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
        .unwrap_or_else(|| "@".to_string())
}

/// Any other async byte stream, labelled by the caller. Used for in-memory
/// `tokio::io::DuplexStream` pairs.
pub struct StreamTransport<S> {
    stream: S,
    local: String,
    remote: String,
}

impl<S> StreamTransport<S> {
    pub fn new(stream: S, local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            stream,
            local: local.into(),
            remote: remote.into(),
        }
    }
}

impl<S> FrameTransport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn local_address(&self) -> String {
        self.local.clone()
    }

    fn remote_address(&self) -> String {
        self.remote.clone()
    }

    fn split_halves(self) -> (BoxFrameSource, BoxFrameSink) {
        let (reader, writer) = tokio::io::split(self.stream);
        byte_halves(reader, writer)
    }
}

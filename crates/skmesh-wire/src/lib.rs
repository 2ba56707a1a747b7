//! skmesh Wire - binary frame protocol and connection multiplexer
//!
//! This crate provides:
//! - The 8-byte little-endian frame header (`module_id`, `message_id`, `body_len`)
//! - Pluggable payload codecs (raw pass-through, JSON, protobuf)
//! - A `FrameTransport` seam: byte streams recover frames from the header,
//!   WebSocket carries one frame per binary message
//! - `Connection`: serialized sends, sequential reads, handler dispatch,
//!   heartbeat watchdog
//! - `NetClient` / `NetServer` for raw TCP and Unix domain sockets, `WsClient`
//!   for WebSocket peers

pub mod client;
pub mod codec;
pub mod connection;
pub mod error;
pub mod frame;
pub mod mux;
pub mod server;
pub mod transport;
pub mod ws;

pub use client::{NetClient, Network};
pub use codec::{Codec, CodecError, JsonCodec, ProtobufCodec, RawCodec};
pub use connection::{Connection, ConnectionOptions};
pub use error::WireError;
pub use frame::{Frame, HEADER_LEN};
pub use mux::ConnMux;
pub use server::NetServer;
pub use transport::{ByteSink, ByteSource, FrameSink, FrameSource, FrameTransport, StreamTransport};
pub use ws::{WebSocketTransport, WsClient};

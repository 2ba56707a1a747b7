//! Wire-level error types

use skmesh_common::MeshError;

use crate::codec::CodecError;

/// Error type for framing, connection, and raw-socket client operations
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream ended in the middle of a header or body.
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    /// A single-frame buffer holds more bytes than its header declares.
    #[error("trailing bytes: frame body declares {expected} bytes, buffer holds {actual}")]
    TrailingBytes { expected: usize, actual: usize },

    #[error("frame body of {len} bytes exceeds the limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    #[error("connection closed")]
    Closed,

    #[error("please connect server first")]
    NotConnected,

    #[error("connection is already being served")]
    AlreadyServing,

    #[error("handler panicked: {0}")]
    HandlerPanicked(String),

    #[error("connect timeout: {0}")]
    ConnectTimeout(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    #[error("configuration error: {0}")]
    Config(String),
}

impl WireError {
    /// Errors that only report the local side having closed the stream.
    pub fn is_closed(&self) -> bool {
        matches!(self, WireError::Closed)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for WireError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        WireError::WebSocket(Box::new(value))
    }
}

impl From<WireError> for MeshError {
    fn from(value: WireError) -> Self {
        match value {
            WireError::Config(msg) => MeshError::Config(msg),
            WireError::Codec(e) => MeshError::Codec(e.to_string()),
            other => MeshError::transport(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, WireError>;

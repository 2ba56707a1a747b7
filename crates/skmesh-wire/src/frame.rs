//! Frame layout
//!
//! ```text
//! [0:2)  module_id  u16 LE
//! [2:4)  message_id u16 LE
//! [4:8)  body_len   u32 LE
//! [8:..) body
//! ```
//!
//! There is no magic number, version, or checksum; integrity relies on the
//! underlying stream being reliable and ordered.

use byteorder::{ByteOrder, LittleEndian};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Result, WireError};

/// Length of the frame header in bytes
pub const HEADER_LEN: usize = 8;

/// One message on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub module_id: u16,
    pub message_id: u16,
    pub body: Bytes,
}

impl Frame {
    pub fn new(module_id: u16, message_id: u16, body: impl Into<Bytes>) -> Self {
        Self {
            module_id,
            message_id,
            body: body.into(),
        }
    }

    /// Dispatch key `(module_id, message_id)`.
    pub fn key(&self) -> (u16, u16) {
        (self.module_id, self.message_id)
    }

    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Encode header and body into one contiguous buffer.
    pub fn encode(&self) -> Result<Bytes> {
        encode_frame(self.module_id, self.message_id, &self.body)
    }

    /// Decode a buffer that holds exactly one frame, as carried by
    /// message-oriented transports (one WebSocket binary message per frame).
    pub fn decode(buf: &[u8]) -> Result<Frame> {
        if buf.len() < HEADER_LEN {
            return Err(WireError::ShortRead {
                expected: HEADER_LEN,
                actual: buf.len(),
            });
        }

        let (module_id, message_id, body_len) = decode_header(&buf[..HEADER_LEN]);
        let body_len = body_len as usize;
        let body = &buf[HEADER_LEN..];
        if body.len() < body_len {
            return Err(WireError::ShortRead {
                expected: body_len,
                actual: body.len(),
            });
        }
        if body.len() > body_len {
            return Err(WireError::TrailingBytes {
                expected: body_len,
                actual: body.len(),
            });
        }

        Ok(Frame::new(module_id, message_id, Bytes::copy_from_slice(body)))
    }
}

pub fn encode_header(module_id: u16, message_id: u16, body_len: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    LittleEndian::write_u16(&mut header[0..2], module_id);
    LittleEndian::write_u16(&mut header[2..4], message_id);
    LittleEndian::write_u32(&mut header[4..8], body_len);
    header
}

/// Returns `(module_id, message_id, body_len)`. `header` must hold at least
/// `HEADER_LEN` bytes.
pub fn decode_header(header: &[u8]) -> (u16, u16, u32) {
    (
        LittleEndian::read_u16(&header[0..2]),
        LittleEndian::read_u16(&header[2..4]),
        LittleEndian::read_u32(&header[4..8]),
    )
}

pub(crate) fn encode_frame(module_id: u16, message_id: u16, body: &[u8]) -> Result<Bytes> {
    let body_len = u32::try_from(body.len()).map_err(|_| WireError::FrameTooLarge {
        len: body.len(),
        max: u32::MAX as usize,
    })?;

    let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
    buf.extend_from_slice(&encode_header(module_id, message_id, body_len));
    buf.extend_from_slice(body);
    Ok(buf.freeze())
}

/// Read one frame from a byte stream.
///
/// Returns `Ok(None)` when the stream ends cleanly before the first header
/// byte. A stream that ends inside a header or body is a `ShortRead`.
pub(crate) async fn read_frame<R>(reader: &mut R, max_body_len: usize) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_LEN];
    let n = read_full(reader, &mut header).await?;
    if n == 0 {
        return Ok(None);
    }
    if n < HEADER_LEN {
        return Err(WireError::ShortRead {
            expected: HEADER_LEN,
            actual: n,
        });
    }

    let (module_id, message_id, body_len) = decode_header(&header);
    let body_len = body_len as usize;
    if body_len > max_body_len {
        return Err(WireError::FrameTooLarge {
            len: body_len,
            max: max_body_len,
        });
    }

    let mut body = BytesMut::zeroed(body_len);
    if body_len > 0 {
        let n = read_full(reader, &mut body).await?;
        if n < body_len {
            return Err(WireError::ShortRead {
                expected: body_len,
                actual: n,
            });
        }
    }

    Ok(Some(Frame::new(module_id, message_id, body.freeze())))
}

/// Fill `buf` unless the stream ends first; returns the number of bytes read.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

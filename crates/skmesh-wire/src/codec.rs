//! Payload codecs
//!
//! A codec converts between an application value and the frame body. The
//! codec is a type parameter of the connection, so one connection speaks one
//! encoding. `RawCodec` is the default and passes bytes and strings through
//! unchanged.

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("json codec: {0}")]
    Json(#[from] serde_json::Error),

    #[error("protobuf decode: {0}")]
    ProtobufDecode(#[from] prost::DecodeError),

    #[error("raw codec: body is not valid utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Encoding of values of type `T` into frame bodies.
pub trait Codec<T>: Send + Sync + 'static {
    fn encode(&self, value: &T) -> Result<Bytes, CodecError>;
    fn decode(&self, body: &[u8]) -> Result<T, CodecError>;
}

/// Pass-through codec for `Bytes`, `Vec<u8>` and `String`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec<Bytes> for RawCodec {
    fn encode(&self, value: &Bytes) -> Result<Bytes, CodecError> {
        Ok(value.clone())
    }

    fn decode(&self, body: &[u8]) -> Result<Bytes, CodecError> {
        Ok(Bytes::copy_from_slice(body))
    }
}

impl Codec<Vec<u8>> for RawCodec {
    fn encode(&self, value: &Vec<u8>) -> Result<Bytes, CodecError> {
        Ok(Bytes::copy_from_slice(value))
    }

    fn decode(&self, body: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(body.to_vec())
    }
}

impl Codec<String> for RawCodec {
    fn encode(&self, value: &String) -> Result<Bytes, CodecError> {
        Ok(Bytes::copy_from_slice(value.as_bytes()))
    }

    fn decode(&self, body: &[u8]) -> Result<String, CodecError> {
        Ok(String::from_utf8(body.to_vec())?)
    }
}

/// JSON bodies through `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<T> Codec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn decode(&self, body: &[u8]) -> Result<T, CodecError> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// Protocol buffer bodies through `prost`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtobufCodec;

impl<T> Codec<T> for ProtobufCodec
where
    T: prost::Message + Default,
{
    fn encode(&self, value: &T) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(value.encode_to_vec()))
    }

    fn decode(&self, body: &[u8]) -> Result<T, CodecError> {
        Ok(T::decode(body)?)
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Login {
        user: String,
        level: u32,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    struct Ping {
        #[prost(uint64, tag = "1")]
        seq: u64,
        #[prost(string, tag = "2")]
        from: String,
    }

    #[test]
    fn test_raw_codec_passes_through() {
        let codec = RawCodec;

        let body = Codec::<String>::encode(&codec, &"hello".to_string()).unwrap();
        assert_eq!(body, Bytes::from_static(b"hello"));
        let text: String = codec.decode(b"world").unwrap();
        assert_eq!(text, "world");

        let raw: Vec<u8> = codec.decode(&[0xff, 0x00]).unwrap();
        assert_eq!(raw, vec![0xff, 0x00]);
        let bytes: Bytes = codec.decode(&[1, 2, 3]).unwrap();
        assert_eq!(bytes.as_ref(), &[1, 2, 3]);
    }

    #[test]
    fn test_raw_codec_rejects_invalid_utf8_string() {
        let result: Result<String, _> = RawCodec.decode(&[0xff, 0xfe]);
        assert!(matches!(result, Err(CodecError::Utf8(_))));
    }

    #[test]
    fn test_json_codec() {
        let login = Login {
            user: "alice".to_string(),
            level: 3,
        };
        let body = JsonCodec.encode(&login).unwrap();
        assert_eq!(body, Bytes::from_static(br#"{"user":"alice","level":3}"#));

        let back: Login = JsonCodec.decode(&body).unwrap();
        assert_eq!(back, login);

        let bad: Result<Login, _> = JsonCodec.decode(b"{not json");
        assert!(matches!(bad, Err(CodecError::Json(_))));
    }

    #[test]
    fn test_protobuf_codec() {
        let ping = Ping {
            seq: 42,
            from: "gate-1".to_string(),
        };
        let body = ProtobufCodec.encode(&ping).unwrap();
        let back: Ping = ProtobufCodec.decode(&body).unwrap();
        assert_eq!(back, ping);

        let bad: Result<Ping, _> = ProtobufCodec.decode(&[0x0a, 0xff]);
        assert!(matches!(bad, Err(CodecError::ProtobufDecode(_))));
    }
}

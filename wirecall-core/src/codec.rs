//! Message codec.
//!
//! Messages are `prost` messages that also derive serde, so the same type can
//! travel as binary protobuf or as JSON. The codec is chosen per call and
//! announced through the content type.

use bytes::Bytes;
use prost::Message;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Bound satisfied by every request and response type.
pub trait RpcMessage: Message + Serialize + DeserializeOwned + Default + Send + Sync + 'static {}

impl<T> RpcMessage for T where T: Message + Serialize + DeserializeOwned + Default + Send + Sync + 'static {}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("failed to serialize message: {0}")]
    Serialization(String),

    #[error("failed to deserialize message: {0}")]
    Deserialization(String),
}

/// Wire encoding of messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    #[default]
    Proto,
    Json,
}

impl Codec {
    pub fn encode<M: RpcMessage>(&self, message: &M) -> Result<Bytes, CodecError> {
        match self {
            Codec::Proto => Ok(Bytes::from(message.encode_to_vec())),
            Codec::Json => serde_json::to_vec(message)
                .map(Bytes::from)
                .map_err(|e| CodecError::Serialization(e.to_string())),
        }
    }

    pub fn decode<M: RpcMessage>(&self, bytes: &[u8]) -> Result<M, CodecError> {
        match self {
            Codec::Proto => M::decode(bytes).map_err(|e| CodecError::Deserialization(e.to_string())),
            Codec::Json => {
                // An empty JSON body is the default message.
                if bytes.is_empty() {
                    return Ok(M::default());
                }
                serde_json::from_slice(bytes).map_err(|e| CodecError::Deserialization(e.to_string()))
            }
        }
    }

    /// Content type of a unary exchange.
    pub fn unary_content_type(&self) -> &'static str {
        match self {
            Codec::Proto => "application/proto",
            Codec::Json => "application/json",
        }
    }

    /// Content type of a streaming exchange.
    pub fn streaming_content_type(&self) -> &'static str {
        match self {
            Codec::Proto => "application/connect+proto",
            Codec::Json => "application/connect+json",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Codec::Proto => "proto",
            Codec::Json => "json",
        }
    }

    pub fn from_name(name: &str) -> Option<Codec> {
        match name {
            "proto" => Some(Codec::Proto),
            "json" => Some(Codec::Json),
            _ => None,
        }
    }
}

/// How a request is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Unary,
    Streaming,
}

/// Detect codec and framing from a request content type.
///
/// Parameters such as `; charset=utf-8` are ignored.
pub fn parse_content_type(content_type: &str) -> Option<(Codec, Framing)> {
    let essence = content_type.split(';').next().unwrap_or_default().trim();
    match essence {
        "application/proto" => Some((Codec::Proto, Framing::Unary)),
        "application/json" => Some((Codec::Json, Framing::Unary)),
        "application/connect+proto" => Some((Codec::Proto, Framing::Streaming)),
        "application/connect+json" => Some((Codec::Json, Framing::Streaming)),
        _ => None,
    }
}

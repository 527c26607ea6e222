//! Streaming envelope framing.
//!
//! Streaming bodies are a sequence of envelopes:
//!
//! ```text
//! [flags:1][length:4, big endian][payload:length]
//! ```
//!
//! The last envelope of a response carries the [`END_STREAM`](envelope_flags::END_STREAM)
//! flag and a JSON payload holding the terminal status and trailing metadata.

use bytes::{Buf, Bytes, BytesMut};
use serde_json::json;

use crate::metadata::Metadata;
use crate::status::Status;

pub mod envelope_flags {
    pub const MESSAGE: u8 = 0x00;
    /// Set on compressed payloads. Compression is not negotiated by wirecall,
    /// so receiving it is a protocol error.
    pub const COMPRESSED: u8 = 0x01;
    pub const END_STREAM: u8 = 0x02;
}

pub const ENVELOPE_HEADER_SIZE: usize = 5;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("incomplete envelope header: expected {expected} bytes, got {actual}")]
    IncompleteHeader { expected: usize, actual: usize },

    #[error("invalid frame flags: 0x{0:02x}")]
    InvalidFlags(u8),

    #[error("envelope of {size} bytes exceeds the limit of {limit} bytes")]
    TooLarge { size: usize, limit: usize },

    #[error("invalid EndStream payload: {0}")]
    InvalidEndStream(String),
}

/// Length prefix for a payload of `len` bytes.
fn envelope_length(len: usize) -> Result<u32, EnvelopeError> {
    u32::try_from(len).map_err(|_| EnvelopeError::TooLarge {
        size: len,
        limit: u32::MAX as usize,
    })
}

/// Frame `payload` with the given flags. Fails if the length does not fit
/// the 4-byte prefix.
pub fn wrap_envelope(payload: &[u8], flags: u8) -> Result<Bytes, EnvelopeError> {
    let length = envelope_length(payload.len())?;
    let mut frame = BytesMut::with_capacity(ENVELOPE_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&[flags]);
    frame.extend_from_slice(&length.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame.freeze())
}

/// Read `(flags, length)` from the front of `data`.
pub fn parse_envelope_header(data: &[u8]) -> Result<(u8, u32), EnvelopeError> {
    if data.len() < ENVELOPE_HEADER_SIZE {
        return Err(EnvelopeError::IncompleteHeader {
            expected: ENVELOPE_HEADER_SIZE,
            actual: data.len(),
        });
    }
    let length = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
    Ok((data[0], length))
}

/// A decoded envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Message(Bytes),
    End(EndStream),
}

/// Pop one complete envelope off the front of `buf`.
///
/// Returns `Ok(None)` when `buf` does not yet hold a whole envelope.
pub fn decode_frame(buf: &mut BytesMut, max_size: usize) -> Result<Option<Frame>, EnvelopeError> {
    if buf.len() < ENVELOPE_HEADER_SIZE {
        return Ok(None);
    }
    let (flags, length) = parse_envelope_header(buf)?;
    let length = length as usize;
    if length > max_size {
        return Err(EnvelopeError::TooLarge {
            size: length,
            limit: max_size,
        });
    }
    if buf.len() < ENVELOPE_HEADER_SIZE + length {
        return Ok(None);
    }
    buf.advance(ENVELOPE_HEADER_SIZE);
    let payload = buf.split_to(length).freeze();

    match flags {
        envelope_flags::MESSAGE => Ok(Some(Frame::Message(payload))),
        envelope_flags::END_STREAM => EndStream::decode(&payload).map(|end| Some(Frame::End(end))),
        other => Err(EnvelopeError::InvalidFlags(other)),
    }
}

/// Terminal envelope of a streaming response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndStream {
    /// `None` means the stream finished with OK.
    pub status: Option<Status>,
    pub trailers: Metadata,
}

impl EndStream {
    pub fn ok(trailers: Metadata) -> Self {
        Self {
            status: None,
            trailers,
        }
    }

    pub fn error(status: Status, trailers: Metadata) -> Self {
        Self {
            status: Some(status),
            trailers,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut body = json!({});
        if let Some(status) = self.status.as_ref().filter(|s| !s.is_ok()) {
            body["error"] = status.to_json();
        }
        if !self.trailers.is_empty() {
            body["metadata"] = self.trailers.to_json();
        }
        body
    }

    /// Encode as a complete END_STREAM envelope.
    pub fn to_frame(&self) -> Bytes {
        let payload = serde_json::to_vec(&self.to_json()).unwrap_or_else(|_| b"{}".to_vec());
        wrap_envelope(&payload, envelope_flags::END_STREAM).unwrap_or_else(|_| {
            let fallback = json!({"error": {"code": "internal", "message": "end of stream too large"}});
            wrap_envelope(fallback.to_string().as_bytes(), envelope_flags::END_STREAM).unwrap_or_default()
        })
    }

    pub fn decode(payload: &[u8]) -> Result<Self, EnvelopeError> {
        if payload.is_empty() {
            return Ok(Self::default());
        }
        let value: serde_json::Value = serde_json::from_slice(payload)
            .map_err(|e| EnvelopeError::InvalidEndStream(e.to_string()))?;
        let status = match value.get("error") {
            Some(error) if !error.is_null() => {
                let raw = serde_json::to_vec(error)
                    .map_err(|e| EnvelopeError::InvalidEndStream(e.to_string()))?;
                Some(
                    Status::from_json(&raw)
                        .map_err(|e| EnvelopeError::InvalidEndStream(e.to_string()))?,
                )
            }
            _ => None,
        };
        let trailers = value
            .get("metadata")
            .map(Metadata::from_json)
            .unwrap_or_default();
        Ok(Self { status, trailers })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Code;

    #[test]
    fn test_wrap_envelope() {
        let frame = wrap_envelope(b"hello", envelope_flags::MESSAGE).unwrap();
        assert_eq!(frame[0], envelope_flags::MESSAGE);
        assert_eq!(&frame[1..5], &[0, 0, 0, 5]);
        assert_eq!(&frame[5..], b"hello");
    }

    #[test]
    fn test_parse_envelope_header_incomplete() {
        assert_eq!(
            parse_envelope_header(&[0, 0, 0]),
            Err(EnvelopeError::IncompleteHeader {
                expected: 5,
                actual: 3
            })
        );
    }

    #[test]
    fn test_decode_frame_waits_for_full_payload() {
        let frame = wrap_envelope(b"abcdef", envelope_flags::MESSAGE).unwrap();
        let mut buf = BytesMut::from(&frame[..7]);
        assert_eq!(decode_frame(&mut buf, 1024).unwrap(), None);
        buf.extend_from_slice(&frame[7..]);
        assert_eq!(
            decode_frame(&mut buf, 1024).unwrap(),
            Some(Frame::Message(Bytes::from_static(b"abcdef")))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_frame_sequence() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&wrap_envelope(b"one", envelope_flags::MESSAGE).unwrap());
        buf.extend_from_slice(&wrap_envelope(b"two", envelope_flags::MESSAGE).unwrap());
        buf.extend_from_slice(&EndStream::default().to_frame());

        assert_eq!(
            decode_frame(&mut buf, 64).unwrap(),
            Some(Frame::Message(Bytes::from_static(b"one")))
        );
        assert_eq!(
            decode_frame(&mut buf, 64).unwrap(),
            Some(Frame::Message(Bytes::from_static(b"two")))
        );
        assert_eq!(
            decode_frame(&mut buf, 64).unwrap(),
            Some(Frame::End(EndStream::default()))
        );
    }

    #[test]
    fn test_decode_frame_rejects_oversize_and_compressed() {
        let mut buf = BytesMut::from(&wrap_envelope(&[0u8; 32], envelope_flags::MESSAGE).unwrap()[..]);
        assert_eq!(
            decode_frame(&mut buf, 16),
            Err(EnvelopeError::TooLarge { size: 32, limit: 16 })
        );

        let mut buf = BytesMut::from(&wrap_envelope(b"z", envelope_flags::COMPRESSED).unwrap()[..]);
        assert_eq!(decode_frame(&mut buf, 16), Err(EnvelopeError::InvalidFlags(0x01)));
    }

    #[test]
    fn test_length_must_fit_prefix() {
        assert_eq!(envelope_length(5), Ok(5));
        assert_eq!(envelope_length(u32::MAX as usize), Ok(u32::MAX));
        let oversized = u32::MAX as usize + 1;
        assert_eq!(
            envelope_length(oversized),
            Err(EnvelopeError::TooLarge {
                size: oversized,
                limit: u32::MAX as usize,
            })
        );
    }

    #[test]
    fn test_end_stream_with_error_and_trailers() {
        let mut trailers = Metadata::new();
        trailers.append("x-count", "3").unwrap();
        let end = EndStream::error(Status::deadline_exceeded("too slow"), trailers);

        let mut buf = BytesMut::from(&end.to_frame()[..]);
        let Some(Frame::End(back)) = decode_frame(&mut buf, 1024).unwrap() else {
            panic!("expected EndStream");
        };
        assert_eq!(back.status.as_ref().map(Status::code), Some(Code::DeadlineExceeded));
        assert_eq!(back.trailers.get_str("x-count"), Some("3"));
    }

    #[test]
    fn test_end_stream_empty_object_is_ok() {
        let end = EndStream::decode(b"{}").unwrap();
        assert!(end.status.is_none());
        assert!(end.trailers.is_empty());
    }
}

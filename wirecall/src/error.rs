//! Server errors and the mapping of statuses onto HTTP responses.
//!
//! Unary failures become a non-2xx HTTP status with a JSON body
//! `{"code", "message", "details"}`. Streaming failures are always HTTP 200:
//! the status travels in the EndStream envelope instead.

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use http::StatusCode;
use wirecall_core::{Codec, EndStream, InvalidMethodPath, Metadata, Status};

/// Errors raised while building or starting a server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    InvalidMethod(#[from] InvalidMethodPath),

    #[error("method `{0}` is registered more than once")]
    DuplicateMethod(String),

    #[error("invalid server configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to bind listener: {0}")]
    Io(#[from] std::io::Error),
}

const TRAILER_PREFIX: &str = "trailer-";

fn metadata_headers(metadata: &Metadata, trailers: &Metadata) -> HeaderMap {
    let mut headers = HeaderMap::new();
    metadata.write_headers(&mut headers);
    // Unary responses carry trailers as prefixed headers.
    let mut prefixed = Metadata::new();
    for (key, value) in trailers {
        let _ = prefixed.append(format!("{TRAILER_PREFIX}{key}"), value.clone());
    }
    prefixed.write_headers(&mut headers);
    headers
}

fn build(status: StatusCode, content_type: &'static str, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

pub(crate) fn unary_success(codec: Codec, metadata: &Metadata, trailers: &Metadata, body: Bytes) -> Response {
    build(
        StatusCode::OK,
        codec.unary_content_type(),
        metadata_headers(metadata, trailers),
        Body::from(body),
    )
}

pub(crate) fn unary_error(status: &Status, metadata: &Metadata, trailers: &Metadata) -> Response {
    let body = serde_json::to_vec(&status.to_json()).unwrap_or_else(|_| b"{}".to_vec());
    build(
        status.code().http_status(),
        "application/json",
        metadata_headers(metadata, trailers),
        Body::from(body),
    )
}

/// A streaming response that fails before sending any message.
pub(crate) fn streaming_error(status: Status, codec: Codec, metadata: &Metadata) -> Response {
    let mut headers = HeaderMap::new();
    metadata.write_headers(&mut headers);
    let frame = EndStream::error(status, Metadata::new()).to_frame();
    build(StatusCode::OK, codec.streaming_content_type(), headers, Body::from(frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use wirecall_core::{Code, Frame, decode_frame};

    #[tokio::test]
    async fn test_unary_error_body() {
        let mut md = Metadata::new();
        md.append("x-request-id", "42").unwrap();
        let response = unary_error(&Status::not_found("nope"), &md, &Metadata::new());

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(response.headers()["x-request-id"], "42");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let status = Status::from_json(&body).unwrap();
        assert_eq!(status.code(), Code::NotFound);
        assert_eq!(status.message(), Some("nope"));
    }

    #[test]
    fn test_trailers_are_prefixed() {
        let mut trailers = Metadata::new();
        trailers.append("x-cost", "7").unwrap();
        let response = unary_success(Codec::Proto, &Metadata::new(), &trailers, Bytes::new());
        assert_eq!(response.headers()["trailer-x-cost"], "7");
        assert_eq!(response.headers()[CONTENT_TYPE], "application/proto");
    }

    #[test]
    fn test_repeated_trailer_keys_keep_every_value() {
        let mut trailers = Metadata::new();
        trailers.append("x-a", "1").unwrap();
        trailers.append("x-b", "2").unwrap();
        trailers.append("x-a", "3").unwrap();
        let response = unary_success(Codec::Proto, &Metadata::new(), &trailers, Bytes::new());

        let values: Vec<_> = response
            .headers()
            .get_all("trailer-x-a")
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(values, ["1", "3"]);
        assert_eq!(response.headers()["trailer-x-b"], "2");
    }

    #[tokio::test]
    async fn test_streaming_error_is_http_ok() {
        let response = streaming_error(Status::unimplemented("no"), Codec::Json, &Metadata::new());
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/connect+json");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let mut buf = bytes::BytesMut::from(&body[..]);
        let Some(Frame::End(end)) = decode_frame(&mut buf, 1024).unwrap() else {
            panic!("expected EndStream frame");
        };
        assert_eq!(end.status.unwrap().code(), Code::Unimplemented);
    }
}

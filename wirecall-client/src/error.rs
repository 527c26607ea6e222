//! Client-side error type.
//!
//! Every failure a call can observe is a [`ClientError`]. Each variant maps
//! onto a status code through [`ClientError::code`], so callers can treat
//! transport and protocol failures the same way as statuses returned by the
//! server.

use bytes::Bytes;
use http::StatusCode;
use wirecall_core::{Code, CodecError, EnvelopeError, ErrorDetail, Status};

/// Errors raised by channels and calls.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ClientError {
    /// A status produced by the server, an interceptor, or the call itself
    /// (deadline, cancellation, channel shutdown).
    #[error("{0}")]
    Status(Status),

    /// The connection could not be established or broke mid-call.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),

    /// The peer sent something that is not valid framing.
    #[error("protocol error: {0}")]
    Protocol(String),
}

macro_rules! error_constructors {
    ($($name:ident => $code:ident;)*) => {
        $(
            pub fn $name<S: Into<String>>(message: S) -> Self {
                Self::new(Code::$code, message)
            }
        )*
    };
}

impl ClientError {
    pub fn new<S: Into<String>>(code: Code, message: S) -> Self {
        ClientError::Status(Status::new(code, message))
    }

    pub fn from_code(code: Code) -> Self {
        ClientError::Status(Status::from_code(code))
    }

    error_constructors! {
        cancelled => Canceled;
        invalid_argument => InvalidArgument;
        deadline_exceeded => DeadlineExceeded;
        not_found => NotFound;
        permission_denied => PermissionDenied;
        resource_exhausted => ResourceExhausted;
        unimplemented => Unimplemented;
        internal => Internal;
        unavailable => Unavailable;
        unauthenticated => Unauthenticated;
    }

    /// Status code of this error.
    ///
    /// Transport failures are `UNAVAILABLE`; codec and framing failures are
    /// `INTERNAL`.
    pub fn code(&self) -> Code {
        match self {
            ClientError::Status(status) => status.code(),
            ClientError::Transport(_) => Code::Unavailable,
            ClientError::Encode(_) | ClientError::Decode(_) | ClientError::Protocol(_) => Code::Internal,
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            ClientError::Status(status) => status.message(),
            ClientError::Transport(msg)
            | ClientError::Encode(msg)
            | ClientError::Decode(msg)
            | ClientError::Protocol(msg) => Some(msg),
        }
    }

    pub fn details(&self) -> &[ErrorDetail] {
        match self {
            ClientError::Status(status) => status.details(),
            _ => &[],
        }
    }

    /// The error as a status, as recorded on the call.
    pub fn to_status(&self) -> Status {
        match self {
            ClientError::Status(status) => status.clone(),
            other => Status::new(other.code(), other.message().unwrap_or_default()),
        }
    }

    /// Whether retrying the call may succeed.
    ///
    /// ```
    /// use wirecall_client::ClientError;
    ///
    /// assert!(ClientError::unavailable("overloaded").is_retryable());
    /// assert!(ClientError::Transport("connection reset".into()).is_retryable());
    /// assert!(!ClientError::not_found("missing").is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }

    pub(crate) fn encode(err: CodecError) -> Self {
        ClientError::Encode(err.to_string())
    }

    pub(crate) fn decode(err: CodecError) -> Self {
        ClientError::Decode(err.to_string())
    }

    /// Error for a non-200 unary response.
    ///
    /// The body should be a JSON status; when it is not, the code is derived
    /// from the HTTP status.
    pub(crate) fn from_response(status: StatusCode, body: &Bytes) -> Self {
        match Status::from_json(body) {
            Ok(parsed) => ClientError::Status(parsed),
            Err(_) => ClientError::new(Code::from_http_status(status), format!("HTTP {status}")),
        }
    }
}

impl From<Status> for ClientError {
    fn from(status: Status) -> Self {
        ClientError::Status(status)
    }
}

impl From<EnvelopeError> for ClientError {
    fn from(err: EnvelopeError) -> Self {
        match err {
            EnvelopeError::TooLarge { .. } => ClientError::resource_exhausted(err.to_string()),
            other => ClientError::Protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_codes() {
        assert_eq!(ClientError::not_found("x").code(), Code::NotFound);
        assert_eq!(ClientError::Transport("refused".into()).code(), Code::Unavailable);
        assert_eq!(ClientError::Encode("e".into()).code(), Code::Internal);
        assert_eq!(ClientError::Decode("d".into()).code(), Code::Internal);
        assert_eq!(ClientError::Protocol("p".into()).code(), Code::Internal);
    }

    #[test]
    fn test_from_response_prefers_json_status() {
        let body = Bytes::from_static(br#"{"code":"permission_denied","message":"no"}"#);
        let err = ClientError::from_response(StatusCode::FORBIDDEN, &body);
        assert_eq!(err.code(), Code::PermissionDenied);
        assert_eq!(err.message(), Some("no"));
    }

    #[test]
    fn test_from_response_falls_back_to_http_status() {
        let err = ClientError::from_response(StatusCode::SERVICE_UNAVAILABLE, &Bytes::from_static(b"<html>"));
        assert_eq!(err.code(), Code::Unavailable);

        let err = ClientError::from_response(StatusCode::NOT_FOUND, &Bytes::new());
        assert_eq!(err.code(), Code::Unimplemented);
    }

    #[test]
    fn test_envelope_errors() {
        let err = ClientError::from(EnvelopeError::TooLarge { size: 10, limit: 5 });
        assert_eq!(err.code(), Code::ResourceExhausted);

        let err = ClientError::from(EnvelopeError::InvalidFlags(0x80));
        assert_eq!(err.code(), Code::Internal);
    }

    #[test]
    fn test_to_status_keeps_details() {
        let status = Status::aborted("retry").add_detail("acme.Hint", vec![1]);
        let err = ClientError::from(status.clone());
        assert_eq!(err.to_status(), status);
        assert!(err.is_retryable());

        let err = ClientError::Transport("reset".into());
        assert_eq!(err.to_status().code(), Code::Unavailable);
        assert_eq!(err.to_status().message(), Some("reset"));
    }
}

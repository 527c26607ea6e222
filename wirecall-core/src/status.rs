//! Status codes and the error taxonomy.
//!
//! Every terminal outcome of a call is described by a [`Status`]: a [`Code`]
//! from a closed set, an optional human-readable message and optional
//! structured [`ErrorDetail`]s.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use http::StatusCode;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// RPC status codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Code {
    Ok = 0,
    Canceled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl Code {
    /// Wire name of the code (`snake_case`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::Ok => "ok",
            Code::Canceled => "canceled",
            Code::Unknown => "unknown",
            Code::InvalidArgument => "invalid_argument",
            Code::DeadlineExceeded => "deadline_exceeded",
            Code::NotFound => "not_found",
            Code::AlreadyExists => "already_exists",
            Code::PermissionDenied => "permission_denied",
            Code::ResourceExhausted => "resource_exhausted",
            Code::FailedPrecondition => "failed_precondition",
            Code::Aborted => "aborted",
            Code::OutOfRange => "out_of_range",
            Code::Unimplemented => "unimplemented",
            Code::Internal => "internal",
            Code::Unavailable => "unavailable",
            Code::DataLoss => "data_loss",
            Code::Unauthenticated => "unauthenticated",
        }
    }

    /// Whether the code describes a transient condition.
    ///
    /// Only explicit retry layers consult this; calls themselves never retry.
    ///
    /// ```
    /// use wirecall_core::Code;
    ///
    /// assert!(Code::Unavailable.is_retryable());
    /// assert!(!Code::InvalidArgument.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Code::Unavailable | Code::ResourceExhausted | Code::Aborted
        )
    }

    /// HTTP status used when this code terminates a unary call.
    pub fn http_status(&self) -> StatusCode {
        match self {
            Code::Ok => StatusCode::OK,
            Code::Canceled => StatusCode::from_u16(499).unwrap_or(StatusCode::REQUEST_TIMEOUT),
            Code::Unknown | Code::Internal | Code::DataLoss => StatusCode::INTERNAL_SERVER_ERROR,
            Code::InvalidArgument | Code::FailedPrecondition | Code::OutOfRange => {
                StatusCode::BAD_REQUEST
            }
            Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            Code::NotFound => StatusCode::NOT_FOUND,
            Code::AlreadyExists | Code::Aborted => StatusCode::CONFLICT,
            Code::PermissionDenied => StatusCode::FORBIDDEN,
            Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
            Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
            Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            Code::Unauthenticated => StatusCode::UNAUTHORIZED,
        }
    }

    /// Best-effort code for an HTTP status that arrived without a status body
    /// (for example from a proxy in front of the server).
    pub fn from_http_status(status: StatusCode) -> Code {
        match status.as_u16() {
            200 => Code::Ok,
            400 => Code::Internal,
            401 => Code::Unauthenticated,
            403 => Code::PermissionDenied,
            404 => Code::Unimplemented,
            408 => Code::DeadlineExceeded,
            429 | 502 | 503 | 504 => Code::Unavailable,
            499 => Code::Canceled,
            _ => Code::Unknown,
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a code name is not recognized.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown status code `{0}`")]
pub struct ParseCodeError(String);

impl FromStr for Code {
    type Err = ParseCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = match s {
            "ok" => Code::Ok,
            "canceled" | "cancelled" => Code::Canceled,
            "unknown" => Code::Unknown,
            "invalid_argument" => Code::InvalidArgument,
            "deadline_exceeded" => Code::DeadlineExceeded,
            "not_found" => Code::NotFound,
            "already_exists" => Code::AlreadyExists,
            "permission_denied" => Code::PermissionDenied,
            "resource_exhausted" => Code::ResourceExhausted,
            "failed_precondition" => Code::FailedPrecondition,
            "aborted" => Code::Aborted,
            "out_of_range" => Code::OutOfRange,
            "unimplemented" => Code::Unimplemented,
            "internal" => Code::Internal,
            "unavailable" => Code::Unavailable,
            "data_loss" => Code::DataLoss,
            "unauthenticated" => Code::Unauthenticated,
            other => return Err(ParseCodeError(other.to_owned())),
        };
        Ok(code)
    }
}

/// Classes of failure a call can end in.
///
/// Each class maps to exactly one [`Code`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// A message could not be encoded or decoded.
    Serialization,
    /// The connection failed or could not be established.
    Transport,
    /// The call's deadline passed.
    Deadline,
    /// The call was cancelled by either side.
    Cancellation,
    /// A handler failed without choosing a code of its own.
    Application,
    /// A bounded resource (worker pool, message size) was exhausted.
    Resource,
    /// No handler is registered for the method.
    Routing,
}

impl ErrorClass {
    pub fn code(&self) -> Code {
        match self {
            ErrorClass::Serialization => Code::Internal,
            ErrorClass::Transport => Code::Unavailable,
            ErrorClass::Deadline => Code::DeadlineExceeded,
            ErrorClass::Cancellation => Code::Canceled,
            ErrorClass::Application => Code::Unknown,
            ErrorClass::Resource => Code::ResourceExhausted,
            ErrorClass::Routing => Code::Unimplemented,
        }
    }
}

/// Structured error detail, the JSON form of a `google.protobuf.Any`.
///
/// On the wire a detail is `{"type": "<message name>", "value": "<base64>"}`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorDetail {
    type_url: String,
    value: Vec<u8>,
}

impl ErrorDetail {
    pub fn new<S: Into<String>>(type_url: S, value: Vec<u8>) -> Self {
        Self {
            type_url: type_url.into(),
            value,
        }
    }

    pub fn type_url(&self) -> &str {
        &self.type_url
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }
}

#[derive(Serialize, Deserialize)]
struct WireDetail {
    #[serde(rename = "type")]
    type_name: String,
    #[serde(default)]
    value: String,
}

impl Serialize for ErrorDetail {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let type_name = self
            .type_url
            .strip_prefix("type.googleapis.com/")
            .unwrap_or(&self.type_url);
        WireDetail {
            type_name: type_name.to_owned(),
            value: base64::engine::general_purpose::STANDARD_NO_PAD.encode(&self.value),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ErrorDetail {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireDetail::deserialize(deserializer)?;
        let value = decode_base64(&wire.value).map_err(serde::de::Error::custom)?;
        Ok(ErrorDetail::new(wire.type_name, value))
    }
}

/// Decode base64 that may or may not carry padding.
pub(crate) fn decode_base64(value: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let trimmed = value.trim_end_matches('=');
    base64::engine::general_purpose::STANDARD_NO_PAD.decode(trimmed)
}

/// Outcome of a call.
///
/// ```
/// use wirecall_core::{Code, Status};
///
/// let status = Status::not_found("no such user").add_detail("acme.UserId", vec![7]);
/// assert_eq!(status.code(), Code::NotFound);
/// assert_eq!(status.message(), Some("no such user"));
/// assert_eq!(status.details().len(), 1);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    code: Code,
    message: Option<String>,
    details: Vec<ErrorDetail>,
}

macro_rules! status_constructors {
    ($($(#[$doc:meta])* $name:ident => $code:ident;)*) => {
        $(
            $(#[$doc])*
            pub fn $name<S: Into<String>>(message: S) -> Self {
                Self::new(Code::$code, message)
            }
        )*
    };
}

impl Status {
    pub fn new<S: Into<String>>(code: Code, message: S) -> Self {
        Self {
            code,
            message: Some(message.into()),
            details: Vec::new(),
        }
    }

    pub fn from_code(code: Code) -> Self {
        Self {
            code,
            message: None,
            details: Vec::new(),
        }
    }

    /// Status for a failure of the given class.
    pub fn from_class<S: Into<String>>(class: ErrorClass, message: S) -> Self {
        Self::new(class.code(), message)
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn details(&self) -> &[ErrorDetail] {
        &self.details
    }

    pub fn add_detail<S: Into<String>>(mut self, type_url: S, value: Vec<u8>) -> Self {
        self.details.push(ErrorDetail::new(type_url, value));
        self
    }

    pub fn add_error_detail(mut self, detail: ErrorDetail) -> Self {
        self.details.push(detail);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    status_constructors! {
        cancelled => Canceled;
        unknown => Unknown;
        invalid_argument => InvalidArgument;
        deadline_exceeded => DeadlineExceeded;
        not_found => NotFound;
        already_exists => AlreadyExists;
        permission_denied => PermissionDenied;
        resource_exhausted => ResourceExhausted;
        failed_precondition => FailedPrecondition;
        aborted => Aborted;
        out_of_range => OutOfRange;
        unimplemented => Unimplemented;
        internal => Internal;
        unavailable => Unavailable;
        data_loss => DataLoss;
        unauthenticated => Unauthenticated;
    }

    /// Serialize as the JSON error body used by unary responses and
    /// EndStream frames.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(StatusBody::from(self)).unwrap_or_else(|_| {
            serde_json::json!({ "code": self.code.as_str() })
        })
    }

    /// Parse a JSON error body. Unknown code names become [`Code::Unknown`].
    pub fn from_json(body: &[u8]) -> Result<Self, serde_json::Error> {
        let body: StatusBody = serde_json::from_slice(body)?;
        Ok(body.into())
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Status {}

/// JSON form of a [`Status`].
#[derive(Serialize, Deserialize)]
pub(crate) struct StatusBody {
    code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    details: Vec<ErrorDetail>,
}

impl From<&Status> for StatusBody {
    fn from(status: &Status) -> Self {
        StatusBody {
            code: status.code.as_str().to_owned(),
            message: status.message.clone(),
            details: status.details.clone(),
        }
    }
}

impl From<StatusBody> for Status {
    fn from(body: StatusBody) -> Self {
        Status {
            code: body.code.parse().unwrap_or(Code::Unknown),
            message: body.message,
            details: body.details,
        }
    }
}

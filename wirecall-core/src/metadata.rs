//! Call metadata.
//!
//! Metadata is an ordered list of `(key, value)` pairs carried alongside a
//! call, distinct from the message payload. Keys are lowercase and may repeat;
//! insertion order is preserved. Keys ending in `-bin` carry binary values,
//! which travel base64-encoded in HTTP headers.
//!
//! HTTP headers and the JSON trailer object group values by key, so the wire
//! forms keep the order of each key's values and the order in which keys
//! first appear, but not the interleaving of different keys: `a=1, b=2, a=3`
//! arrives as `a=1, a=3, b=2`.

use base64::Engine;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};

use crate::status::decode_base64;

/// Suffix marking a key whose values are binary.
pub const BINARY_SUFFIX: &str = "-bin";

/// Headers owned by the protocol or the HTTP layer. They never surface as
/// metadata and cannot be set through it.
const RESERVED: &[&str] = &[
    "accept-encoding",
    "connection",
    "content-encoding",
    "content-length",
    "content-type",
    "date",
    "host",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "user-agent",
];

/// Whether `key` is reserved for the protocol.
pub fn is_reserved_key(key: &str) -> bool {
    key.starts_with("connect-") || RESERVED.contains(&key)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetadataError {
    #[error("invalid metadata key `{0}`: keys are non-empty lowercase [a-z0-9-_.]")]
    InvalidKey(String),

    #[error("metadata key `{0}` is reserved")]
    ReservedKey(String),

    #[error("invalid value for metadata key `{0}`: ASCII values must be printable")]
    InvalidValue(String),

    #[error("metadata key `{0}`: binary values require a `-bin` key and `-bin` keys require binary values")]
    BinaryMismatch(String),
}

/// A single metadata value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataValue {
    Ascii(String),
    Binary(Bytes),
}

impl MetadataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Ascii(s) => Some(s),
            MetadataValue::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            MetadataValue::Ascii(s) => s.as_bytes(),
            MetadataValue::Binary(b) => b,
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, MetadataValue::Binary(_))
    }

    fn to_header_value(&self) -> Option<HeaderValue> {
        match self {
            MetadataValue::Ascii(s) => HeaderValue::from_str(s).ok(),
            MetadataValue::Binary(b) => HeaderValue::from_str(
                &base64::engine::general_purpose::STANDARD_NO_PAD.encode(b),
            )
            .ok(),
        }
    }

    fn wire_string(&self) -> String {
        match self {
            MetadataValue::Ascii(s) => s.clone(),
            MetadataValue::Binary(b) => base64::engine::general_purpose::STANDARD_NO_PAD.encode(b),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::Ascii(value.to_owned())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::Ascii(value)
    }
}

impl From<Bytes> for MetadataValue {
    fn from(value: Bytes) -> Self {
        MetadataValue::Binary(value)
    }
}

impl From<Vec<u8>> for MetadataValue {
    fn from(value: Vec<u8>) -> Self {
        MetadataValue::Binary(Bytes::from(value))
    }
}

/// Ordered, multi-valued call metadata.
///
/// ```
/// use wirecall_core::Metadata;
///
/// let mut md = Metadata::new();
/// md.append("x-trace", "a").unwrap();
/// md.append("x-tenant", "acme").unwrap();
/// md.append("x-trace", "b").unwrap();
///
/// let traces: Vec<_> = md.get_all("x-trace").filter_map(|v| v.as_str()).collect();
/// assert_eq!(traces, ["a", "b"]);
/// assert!(md.append("X-Upper", "no").is_err());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, MetadataValue)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pair after all existing pairs.
    pub fn append<K, V>(&mut self, key: K, value: V) -> Result<(), MetadataError>
    where
        K: Into<String>,
        V: Into<MetadataValue>,
    {
        let key = key.into();
        let value = value.into();
        validate(&key, &value)?;
        self.entries.push((key, value));
        Ok(())
    }

    /// Replace every value of `key` with a single value, keeping the position
    /// of the first existing pair.
    pub fn insert<K, V>(&mut self, key: K, value: V) -> Result<(), MetadataError>
    where
        K: Into<String>,
        V: Into<MetadataValue>,
    {
        let key = key.into();
        let value = value.into();
        validate(&key, &value)?;
        match self.entries.iter().position(|(k, _)| *k == key) {
            Some(first) => {
                self.entries[first].1 = value;
                let mut index = 0;
                self.entries.retain(|(k, _)| {
                    let keep = index <= first || *k != key;
                    index += 1;
                    keep
                });
            }
            None => self.entries.push((key, value)),
        }
        Ok(())
    }

    /// Builder form of [`append`](Self::append).
    pub fn with<K, V>(mut self, key: K, value: V) -> Result<Self, MetadataError>
    where
        K: Into<String>,
        V: Into<MetadataValue>,
    {
        self.append(key, value)?;
        Ok(self)
    }

    /// First value of `key`.
    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// First value of `key` if it is ASCII.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(MetadataValue::as_str)
    }

    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a MetadataValue> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Remove every value of `key`, returning how many were removed.
    pub fn remove(&mut self, key: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| k != key);
        before - self.entries.len()
    }

    /// Append every pair of `other`, in order.
    pub fn extend(&mut self, other: Metadata) {
        self.entries.extend(other.entries);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetadataValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Collect metadata from HTTP headers, skipping reserved headers and
    /// values that do not decode.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut entries = Vec::new();
        for (name, value) in headers {
            let key = name.as_str();
            if is_reserved_key(key) {
                continue;
            }
            if let Some(value) = decode_wire_value(key, value.as_bytes()) {
                entries.push((key.to_owned(), value));
            }
        }
        Self { entries }
    }

    /// Append every pair to `headers`. Values of one key stay in order.
    pub fn write_headers(&self, headers: &mut HeaderMap) {
        for (key, value) in &self.entries {
            let (Ok(name), Some(value)) = (HeaderName::from_bytes(key.as_bytes()), value.to_header_value())
            else {
                continue;
            };
            headers.append(name, value);
        }
    }

    /// JSON object form used for stream trailers: `{"key": ["v1", "v2"]}`.
    /// Keys appear in order of first occurrence.
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (key, value) in &self.entries {
            let slot = map
                .entry(key.clone())
                .or_insert_with(|| serde_json::Value::Array(Vec::new()));
            if let serde_json::Value::Array(values) = slot {
                values.push(serde_json::Value::String(value.wire_string()));
            }
        }
        serde_json::Value::Object(map)
    }

    /// Parse the JSON object form, skipping entries that do not decode.
    pub fn from_json(value: &serde_json::Value) -> Self {
        let mut entries = Vec::new();
        let Some(map) = value.as_object() else {
            return Self { entries };
        };
        for (key, values) in map {
            let key = key.to_ascii_lowercase();
            if is_reserved_key(&key) {
                continue;
            }
            let Some(values) = values.as_array() else {
                continue;
            };
            for value in values.iter().filter_map(|v| v.as_str()) {
                if let Some(value) = decode_wire_value(&key, value.as_bytes()) {
                    entries.push((key.clone(), value));
                }
            }
        }
        Self { entries }
    }
}

impl<'a> IntoIterator for &'a Metadata {
    type Item = (&'a str, &'a MetadataValue);
    type IntoIter = Box<dyn Iterator<Item = (&'a str, &'a MetadataValue)> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

fn validate(key: &str, value: &MetadataValue) -> Result<(), MetadataError> {
    let valid_key = !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'-' | b'_' | b'.'));
    if !valid_key {
        return Err(MetadataError::InvalidKey(key.to_owned()));
    }
    if is_reserved_key(key) {
        return Err(MetadataError::ReservedKey(key.to_owned()));
    }
    if key.ends_with(BINARY_SUFFIX) != value.is_binary() {
        return Err(MetadataError::BinaryMismatch(key.to_owned()));
    }
    if let MetadataValue::Ascii(s) = value {
        if !s.bytes().all(|b| (0x20..=0x7e).contains(&b)) {
            return Err(MetadataError::InvalidValue(key.to_owned()));
        }
    }
    Ok(())
}

fn decode_wire_value(key: &str, raw: &[u8]) -> Option<MetadataValue> {
    let text = std::str::from_utf8(raw).ok()?;
    if key.ends_with(BINARY_SUFFIX) {
        decode_base64(text.trim())
            .ok()
            .map(|b| MetadataValue::Binary(Bytes::from(b)))
    } else if text.bytes().all(|b| (0x20..=0x7e).contains(&b)) {
        Some(MetadataValue::Ascii(text.to_owned()))
    } else {
        None
    }
}

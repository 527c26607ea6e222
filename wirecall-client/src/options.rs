//! Channel and per-call options.
//!
//! Channel options can be set through typed setters or through the string
//! keys in [`keys`], which is how options usually arrive from configuration:
//!
//! ```
//! use wirecall_client::ChannelOptions;
//!
//! let options = ChannelOptions::from_pairs([
//!     ("lb_policy_name", "round_robin"),
//!     ("max_receive_message_length", "1048576"),
//!     ("grpc.some_unknown_key", "ignored"),
//! ])
//! .unwrap();
//! assert_eq!(options.limits().receive_limit(), 1_048_576);
//!
//! assert!(ChannelOptions::from_pairs([("keepalive_time_ms", "soon")]).is_err());
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use wirecall_core::{Codec, DEFAULT_MAX_MESSAGE_SIZE, MessageLimits, Metadata, MetadataError, MetadataValue};

use crate::ClientError;

/// Recognized channel option keys.
pub mod keys {
    pub const LB_POLICY_NAME: &str = "lb_policy_name";
    pub const KEEPALIVE_TIME_MS: &str = "keepalive_time_ms";
    pub const KEEPALIVE_TIMEOUT_MS: &str = "keepalive_timeout_ms";
    pub const MAX_SEND_MESSAGE_LENGTH: &str = "max_send_message_length";
    pub const MAX_RECEIVE_MESSAGE_LENGTH: &str = "max_receive_message_length";
    pub const PRIMARY_USER_AGENT: &str = "primary_user_agent";
    pub const IDLE_TIMEOUT_MS: &str = "idle_timeout_ms";
    pub const HTTP2_ONLY: &str = "http2_only";
    pub const CODEC: &str = "codec";
}

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// User agent sent after any configured primary user agent.
pub const USER_AGENT: &str = concat!("wirecall-client/", env!("CARGO_PKG_VERSION"));

/// How a channel picks among the addresses a target resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LbPolicy {
    /// Try the resolved addresses in order.
    #[default]
    PickFirst,
    /// Start each new connection at the next resolved address.
    RoundRobin,
}

impl LbPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LbPolicy::PickFirst => "pick_first",
            LbPolicy::RoundRobin => "round_robin",
        }
    }
}

impl fmt::Display for LbPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LbPolicy {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pick_first" => Ok(LbPolicy::PickFirst),
            "round_robin" => Ok(LbPolicy::RoundRobin),
            other => Err(invalid(keys::LB_POLICY_NAME, other)),
        }
    }
}

fn invalid(key: &str, value: &str) -> ClientError {
    ClientError::invalid_argument(format!("invalid value `{value}` for channel option `{key}`"))
}

fn parse_millis(key: &str, value: &str) -> Result<Duration, ClientError> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| invalid(key, value))
}

/// A message length; negative means unlimited.
fn parse_length(key: &str, value: &str) -> Result<Option<usize>, ClientError> {
    let n: i64 = value.trim().parse().map_err(|_| invalid(key, value))?;
    if n < 0 {
        return Ok(None);
    }
    usize::try_from(n).map(Some).map_err(|_| invalid(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ClientError> {
    match value.trim() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

/// Options fixed for the lifetime of a channel.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    lb_policy: LbPolicy,
    keepalive_time: Option<Duration>,
    keepalive_timeout: Option<Duration>,
    max_send: Option<usize>,
    max_receive: Option<usize>,
    primary_user_agent: Option<String>,
    idle_timeout: Duration,
    http2_only: bool,
    codec: Codec,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            lb_policy: LbPolicy::default(),
            keepalive_time: None,
            keepalive_timeout: None,
            max_send: None,
            max_receive: Some(DEFAULT_MAX_MESSAGE_SIZE),
            primary_user_agent: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            http2_only: false,
            codec: Codec::default(),
        }
    }
}

impl ChannelOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build options from string pairs. See [`ChannelOptions::set`].
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, ClientError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut options = Self::default();
        for (key, value) in pairs {
            options.set(key.as_ref(), value.as_ref())?;
        }
        Ok(options)
    }

    /// Set an option by key.
    ///
    /// Unknown keys are ignored. A malformed value for a known key fails with
    /// `INVALID_ARGUMENT`.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ClientError> {
        match key {
            keys::LB_POLICY_NAME => self.lb_policy = value.trim().parse()?,
            keys::KEEPALIVE_TIME_MS => self.keepalive_time = Some(parse_millis(key, value)?),
            keys::KEEPALIVE_TIMEOUT_MS => self.keepalive_timeout = Some(parse_millis(key, value)?),
            keys::MAX_SEND_MESSAGE_LENGTH => self.max_send = parse_length(key, value)?,
            keys::MAX_RECEIVE_MESSAGE_LENGTH => self.max_receive = parse_length(key, value)?,
            keys::PRIMARY_USER_AGENT => {
                if value.is_empty() || http::HeaderValue::from_str(value).is_err() {
                    return Err(invalid(key, value));
                }
                self.primary_user_agent = Some(value.to_owned());
            }
            keys::IDLE_TIMEOUT_MS => self.idle_timeout = parse_millis(key, value)?,
            keys::HTTP2_ONLY => self.http2_only = parse_bool(key, value)?,
            keys::CODEC => self.codec = Codec::from_name(value.trim()).ok_or_else(|| invalid(key, value))?,
            _ => {
                #[cfg(feature = "tracing")]
                tracing::debug!(key, "ignoring unknown channel option");
            }
        }
        Ok(())
    }

    pub fn lb_policy(mut self, policy: LbPolicy) -> Self {
        self.lb_policy = policy;
        self
    }

    /// Interval between HTTP/2 keepalive pings.
    pub fn keepalive_time(mut self, interval: Duration) -> Self {
        self.keepalive_time = Some(interval);
        self
    }

    /// How long to wait for a keepalive ping to be acknowledged.
    pub fn keepalive_timeout(mut self, timeout: Duration) -> Self {
        self.keepalive_timeout = Some(timeout);
        self
    }

    pub fn max_send_message_length(mut self, bytes: usize) -> Self {
        self.max_send = Some(bytes);
        self
    }

    pub fn max_receive_message_length(mut self, bytes: usize) -> Self {
        self.max_receive = Some(bytes);
        self
    }

    pub fn primary_user_agent<S: Into<String>>(mut self, agent: S) -> Self {
        self.primary_user_agent = Some(agent.into());
        self
    }

    /// How long a pooled connection may sit idle before it is closed.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Speak HTTP/2 without negotiation, also over plaintext.
    pub fn http2_only(mut self, enabled: bool) -> Self {
        self.http2_only = enabled;
        self
    }

    pub fn codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    pub fn get_lb_policy(&self) -> LbPolicy {
        self.lb_policy
    }

    pub fn get_keepalive_time(&self) -> Option<Duration> {
        self.keepalive_time
    }

    pub fn get_keepalive_timeout(&self) -> Option<Duration> {
        self.keepalive_timeout
    }

    pub fn get_idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn is_http2_only(&self) -> bool {
        self.http2_only
    }

    pub fn get_codec(&self) -> Codec {
        self.codec
    }

    pub fn limits(&self) -> MessageLimits {
        let mut limits = MessageLimits::unlimited();
        if let Some(bytes) = self.max_send {
            limits = limits.max_send(bytes);
        }
        if let Some(bytes) = self.max_receive {
            limits = limits.max_receive(bytes);
        }
        limits
    }

    /// Value of the `user-agent` header.
    pub fn user_agent(&self) -> String {
        match &self.primary_user_agent {
            Some(primary) => format!("{primary} {USER_AGENT}"),
            None => USER_AGENT.to_owned(),
        }
    }
}

/// Options for a single call.
///
/// A timeout is relative to the moment the call starts; a deadline is
/// absolute. When both are given the earlier one applies.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    metadata: Metadata,
    cancellation: Option<CancellationToken>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Replace the call's metadata.
    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Append one metadata pair.
    pub fn with_metadata<K, V>(mut self, key: K, value: V) -> Result<Self, MetadataError>
    where
        K: Into<String>,
        V: Into<MetadataValue>,
    {
        self.metadata.append(key, value)?;
        Ok(self)
    }

    /// Cancel the call when `token` is cancelled.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn get_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn get_metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Absolute deadline of a call starting at `now`.
    pub fn resolve_deadline(&self, now: Instant) -> Option<Instant> {
        let relative = self.timeout.and_then(|t| now.checked_add(t));
        match (relative, self.deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (one, other) => one.or(other),
        }
    }

    pub(crate) fn into_parts(self) -> (Metadata, Option<CancellationToken>) {
        (self.metadata, self.cancellation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ChannelOptions::default();
        assert_eq!(options.get_lb_policy(), LbPolicy::PickFirst);
        assert_eq!(options.get_codec(), Codec::Proto);
        assert_eq!(options.limits(), MessageLimits::default());
        assert_eq!(options.user_agent(), USER_AGENT);
        assert!(!options.is_http2_only());
    }

    #[test]
    fn test_string_keys() {
        let options = ChannelOptions::from_pairs([
            (keys::LB_POLICY_NAME, "round_robin"),
            (keys::KEEPALIVE_TIME_MS, "10000"),
            (keys::KEEPALIVE_TIMEOUT_MS, "2000"),
            (keys::MAX_SEND_MESSAGE_LENGTH, "64"),
            (keys::MAX_RECEIVE_MESSAGE_LENGTH, "-1"),
            (keys::PRIMARY_USER_AGENT, "greeter/1.0"),
            (keys::IDLE_TIMEOUT_MS, "500"),
            (keys::HTTP2_ONLY, "true"),
            (keys::CODEC, "json"),
        ])
        .unwrap();

        assert_eq!(options.get_lb_policy(), LbPolicy::RoundRobin);
        assert_eq!(options.get_keepalive_time(), Some(Duration::from_secs(10)));
        assert_eq!(options.get_keepalive_timeout(), Some(Duration::from_secs(2)));
        assert_eq!(options.limits(), MessageLimits::unlimited().max_send(64));
        assert_eq!(options.user_agent(), format!("greeter/1.0 {USER_AGENT}"));
        assert_eq!(options.get_idle_timeout(), Duration::from_millis(500));
        assert!(options.is_http2_only());
        assert_eq!(options.get_codec(), Codec::Json);
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let options = ChannelOptions::from_pairs([("grpc.census", "1"), ("whatever", "x")]).unwrap();
        assert_eq!(options.get_lb_policy(), LbPolicy::PickFirst);
    }

    #[test]
    fn test_malformed_values_are_rejected() {
        for (key, value) in [
            (keys::LB_POLICY_NAME, "weighted"),
            (keys::KEEPALIVE_TIME_MS, "-5"),
            (keys::MAX_SEND_MESSAGE_LENGTH, "big"),
            (keys::HTTP2_ONLY, "yes please"),
            (keys::CODEC, "xml"),
            (keys::PRIMARY_USER_AGENT, ""),
        ] {
            let err = ChannelOptions::from_pairs([(key, value)]).unwrap_err();
            assert_eq!(err.code(), wirecall_core::Code::InvalidArgument, "{key}={value}");
        }
    }

    #[test]
    fn test_deadline_resolution() {
        let now = Instant::now();
        assert_eq!(CallOptions::new().resolve_deadline(now), None);

        let options = CallOptions::new().timeout(Duration::from_secs(5));
        assert_eq!(options.resolve_deadline(now), Some(now + Duration::from_secs(5)));

        let earlier = now + Duration::from_secs(1);
        let options = options.deadline(earlier);
        assert_eq!(options.resolve_deadline(now), Some(earlier));
    }

    #[test]
    fn test_call_metadata() {
        let options = CallOptions::new().with_metadata("x-trace", "abc").unwrap();
        assert_eq!(options.get_metadata().get_str("x-trace"), Some("abc"));
        assert!(CallOptions::new().with_metadata("content-type", "x").is_err());
    }
}

//! The `connect-timeout-ms` header.
//!
//! A deadline travels as the remaining time in whole milliseconds. Zero,
//! negative or malformed values mean the call has no deadline.

use std::time::Duration;

use http::HeaderValue;

pub const TIMEOUT_HEADER: &str = "connect-timeout-ms";

/// Largest value the header may carry (ten digits).
pub const MAX_TIMEOUT_MS: u128 = 9_999_999_999;

/// Header value for the remaining time of a call.
///
/// Sub-millisecond remainders round up to one millisecond so a live deadline
/// is never sent as "no deadline"; values beyond ten digits are capped.
pub fn encode_timeout(remaining: Duration) -> HeaderValue {
    let ms = remaining.as_millis().clamp(1, MAX_TIMEOUT_MS);
    HeaderValue::from(ms as u64)
}

pub fn parse_timeout(value: &HeaderValue) -> Option<Duration> {
    parse_timeout_ms(value.to_str().ok()?)
}

pub fn parse_timeout_ms(value: &str) -> Option<Duration> {
    if value.is_empty() || value.len() > 10 {
        return None;
    }
    match value.parse::<u64>().ok()? {
        0 => None,
        ms => Some(Duration::from_millis(ms)),
    }
}

/// The tighter of two optional timeouts.
pub fn effective_timeout(server: Option<Duration>, client: Option<Duration>) -> Option<Duration> {
    match (server, client) {
        (Some(s), Some(c)) => Some(s.min(c)),
        (one, other) => one.or(other),
    }
}

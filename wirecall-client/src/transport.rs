//! HTTP transport of a channel.
//!
//! A channel owns one [`HyperTransport`]: hyper_util's pooled legacy client
//! over a plain or TLS connector, chosen by the channel credentials. Address
//! resolution goes through [`DnsResolver`], which applies the channel's load
//! balancing policy.
//!
//! # Feature Flags
//!
//! TLS needs a crypto provider and, unless the credentials carry their own
//! roots, a trust store:
//!
//! - `tls` (default) - Enables `tls-ring` + `tls-native-roots`
//! - `tls-ring` / `tls-aws-lc` - Crypto providers
//! - `tls-native-roots` / `tls-webpki-roots` - Root certificates

mod hyper;
mod resolver;

pub(crate) use self::hyper::HyperTransport;
pub(crate) use resolver::DnsResolver;

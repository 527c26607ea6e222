//! Pooled HTTP client behind a channel.

use std::error::Error as _;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioTimer};

use super::DnsResolver;
use crate::ClientError;
use crate::credentials::{ChannelCredentials, Connector, PlainConnector, SecureConnector};
use crate::options::ChannelOptions;

/// hyper_util's legacy client over the connector the credentials negotiated.
///
/// Cloning is cheap and shares the connection pool.
#[derive(Clone)]
pub(crate) enum HyperTransport {
    Plain(Client<PlainConnector, Full<Bytes>>),
    Secure(Client<SecureConnector, Full<Bytes>>),
}

impl std::fmt::Debug for HyperTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            HyperTransport::Plain(_) => "plain",
            HyperTransport::Secure(_) => "secure",
        };
        f.debug_tuple("HyperTransport").field(&kind).finish()
    }
}

impl HyperTransport {
    /// Build the client. No connection is opened until the first request.
    pub(crate) fn establish(
        credentials: &ChannelCredentials,
        options: &ChannelOptions,
    ) -> Result<Self, ClientError> {
        let mut http = HttpConnector::new_with_resolver(DnsResolver::new(options.get_lb_policy()));
        http.set_nodelay(true);
        let connector = credentials.negotiate(http)?;

        let mut builder = Client::builder(TokioExecutor::new());
        // The timers drive idle pool eviction and HTTP/2 pings.
        builder
            .pool_timer(TokioTimer::new())
            .timer(TokioTimer::new())
            .pool_idle_timeout(options.get_idle_timeout());
        if options.is_http2_only() {
            builder.http2_only(true);
        }
        if let Some(interval) = options.get_keepalive_time() {
            builder
                .http2_keep_alive_interval(interval)
                .http2_keep_alive_while_idle(true);
        }
        if let Some(timeout) = options.get_keepalive_timeout() {
            builder.http2_keep_alive_timeout(timeout);
        }

        Ok(match connector {
            Connector::Plain(c) => HyperTransport::Plain(builder.build(c)),
            Connector::Secure(c) => HyperTransport::Secure(builder.build(c)),
        })
    }

    pub(crate) fn is_secure(&self) -> bool {
        matches!(self, HyperTransport::Secure(_))
    }

    pub(crate) async fn request(
        &self,
        request: http::Request<Full<Bytes>>,
    ) -> Result<http::Response<Incoming>, ClientError> {
        let result = match self {
            HyperTransport::Plain(client) => client.request(request).await,
            HyperTransport::Secure(client) => client.request(request).await,
        };
        result.map_err(|e| {
            // The legacy client's Display hides the cause, e.g. "connection refused".
            let mut message = format!("request failed: {e}");
            let mut source = e.source();
            while let Some(cause) = source {
                message.push_str(&format!(": {cause}"));
                source = cause.source();
            }
            ClientError::Transport(message)
        })
    }
}

//! DNS resolution with a load balancing policy.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};

use hyper_util::client::legacy::connect::dns::Name;
use tower_service::Service;

use crate::options::LbPolicy;

/// Resolver handed to hyper's `HttpConnector`.
///
/// The connector tries the returned addresses in order, so `pick_first`
/// keeps the resolver's order and `round_robin` rotates the list by one for
/// every new connection.
#[derive(Clone, Debug)]
pub(crate) struct DnsResolver {
    policy: LbPolicy,
    cursor: Arc<AtomicUsize>,
}

impl DnsResolver {
    pub(crate) fn new(policy: LbPolicy) -> Self {
        Self {
            policy,
            cursor: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn order(&self, mut addrs: Vec<SocketAddr>) -> Vec<SocketAddr> {
        if self.policy == LbPolicy::RoundRobin && !addrs.is_empty() {
            let start = self.cursor.fetch_add(1, Ordering::Relaxed) % addrs.len();
            addrs.rotate_left(start);
        }
        addrs
    }
}

impl Service<Name> for DnsResolver {
    type Response = std::vec::IntoIter<SocketAddr>;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = io::Result<Self::Response>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, name: Name) -> Self::Future {
        let resolver = self.clone();
        Box::pin(async move {
            // The connector fills in the port after resolution.
            let addrs: Vec<SocketAddr> = tokio::net::lookup_host((name.as_str(), 0)).await?.collect();
            #[cfg(feature = "tracing")]
            tracing::trace!(host = name.as_str(), count = addrs.len(), policy = %resolver.policy, "resolved");
            Ok(resolver.order(addrs).into_iter())
        })
    }
}

//! Server interceptors.
//!
//! An interceptor receives the call and a [`Next`] continuation. It may run
//! the continuation (optionally changing the call on the way in or the reply
//! on the way out) or return a status of its own without reaching the
//! handler.
//!
//! Interceptors are composed once, when the server is built, into a single
//! nested closure per method. For a chain `[a, b]` a call runs `a`, which
//! runs `b`, which runs the handler.
//!
//! ```rust,ignore
//! use wirecall::prelude::*;
//!
//! let server = Server::builder()
//!     .interceptor(TraceInterceptor::new())
//!     .interceptor(RequireMetadata::new("authorization"))
//!     .unary("/Greeter/SayHello", say_hello)
//!     .build()?;
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;
use tracing::Instrument;
use wirecall_core::{Code, Codec, Metadata, MetadataValue, Status};

use crate::request::CallContext;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Encoded response messages of a streaming call.
pub type ReplyStream = Pin<Box<dyn Stream<Item = Result<Bytes, Status>> + Send>>;

/// Type-erased method dispatch: a call in, a reply out.
pub type Dispatch = Arc<dyn Fn(ServerCall) -> BoxFuture<'static, Result<ServerReply, Status>> + Send + Sync>;

/// Erase a closure into a [`Dispatch`].
pub fn dispatch_fn<F>(f: F) -> Dispatch
where
    F: Fn(ServerCall) -> BoxFuture<'static, Result<ServerReply, Status>> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// A call as seen by interceptors: context plus the still-encoded request.
pub struct ServerCall {
    pub context: CallContext,
    pub codec: Codec,
    pub payload: Bytes,
}

impl fmt::Debug for ServerCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCall")
            .field("method", &self.context.method().as_str())
            .field("codec", &self.codec)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

pub enum ReplyBody {
    Unary(Bytes),
    Stream(ReplyStream),
}

/// A reply on its way back to the client.
pub struct ServerReply {
    pub metadata: Metadata,
    pub trailers: Metadata,
    pub body: ReplyBody,
}

impl ServerReply {
    pub fn unary(body: Bytes) -> Self {
        Self {
            metadata: Metadata::new(),
            trailers: Metadata::new(),
            body: ReplyBody::Unary(body),
        }
    }

    pub fn stream(stream: ReplyStream) -> Self {
        Self {
            metadata: Metadata::new(),
            trailers: Metadata::new(),
            body: ReplyBody::Stream(stream),
        }
    }
}

impl fmt::Debug for ServerReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = match &self.body {
            ReplyBody::Unary(bytes) => format!("Unary({} bytes)", bytes.len()),
            ReplyBody::Stream(_) => "Stream".to_owned(),
        };
        f.debug_struct("ServerReply")
            .field("metadata", &self.metadata)
            .field("trailers", &self.trailers)
            .field("body", &body)
            .finish()
    }
}

/// The rest of the chain.
#[derive(Clone)]
pub struct Next {
    inner: Dispatch,
}

impl Next {
    pub fn new(inner: Dispatch) -> Self {
        Self { inner }
    }

    pub fn run(self, call: ServerCall) -> BoxFuture<'static, Result<ServerReply, Status>> {
        (self.inner)(call)
    }
}

pub trait ServerInterceptor: Send + Sync + 'static {
    fn intercept(&self, call: ServerCall, next: Next) -> BoxFuture<'static, Result<ServerReply, Status>>;
}

impl<I: ServerInterceptor + ?Sized> ServerInterceptor for Arc<I> {
    fn intercept(&self, call: ServerCall, next: Next) -> BoxFuture<'static, Result<ServerReply, Status>> {
        (**self).intercept(call, next)
    }
}

/// Wrap `handler` so that `interceptors[0]` runs outermost.
pub(crate) fn compose(interceptors: &[Arc<dyn ServerInterceptor>], handler: Dispatch) -> Dispatch {
    interceptors.iter().rev().fold(handler, |next, interceptor| {
        let interceptor = interceptor.clone();
        dispatch_fn(move |call| interceptor.intercept(call, Next::new(next.clone())))
    })
}

/// Rejects calls that lack a metadata key (or carry the wrong value).
#[derive(Debug, Clone)]
pub struct RequireMetadata {
    key: String,
    value: Option<MetadataValue>,
    rejection: Status,
}

impl RequireMetadata {
    /// Rejects with `UNAUTHENTICATED` by default.
    pub fn new<K: Into<String>>(key: K) -> Self {
        let key = key.into();
        let rejection = Status::unauthenticated(format!("missing required metadata `{key}`"));
        Self {
            key,
            value: None,
            rejection,
        }
    }

    /// Require this exact value.
    pub fn with_value<V: Into<MetadataValue>>(mut self, value: V) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn reject_with(mut self, status: Status) -> Self {
        self.rejection = status;
        self
    }

    fn accepts(&self, metadata: &Metadata) -> bool {
        match &self.value {
            None => metadata.contains_key(&self.key),
            Some(expected) => metadata.get_all(&self.key).any(|v| v == expected),
        }
    }
}

impl ServerInterceptor for RequireMetadata {
    fn intercept(&self, call: ServerCall, next: Next) -> BoxFuture<'static, Result<ServerReply, Status>> {
        if self.accepts(call.context.metadata()) {
            next.run(call)
        } else {
            tracing::debug!(
                method = %call.context.method(),
                key = %self.key,
                "rejecting call without required metadata"
            );
            let rejection = self.rejection.clone();
            Box::pin(async move { Err(rejection) })
        }
    }
}

/// Records one span per call and logs its outcome.
#[derive(Debug, Clone, Default)]
pub struct TraceInterceptor {
    _private: (),
}

impl TraceInterceptor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ServerInterceptor for TraceInterceptor {
    fn intercept(&self, call: ServerCall, next: Next) -> BoxFuture<'static, Result<ServerReply, Status>> {
        let span = tracing::info_span!(
            "rpc.call",
            rpc.method = %call.context.method(),
            rpc.encoding = call.codec.name(),
            otel.kind = "server",
        );
        Box::pin(
            async move {
                let started = tokio::time::Instant::now();
                let result = next.run(call).await;
                let code = result.as_ref().err().map_or(Code::Ok, Status::code);
                tracing::info!(code = %code, elapsed_ms = started.elapsed().as_millis() as u64, "call finished");
                result
            }
            .instrument(span),
        )
    }
}

/// Interceptor backed by a closure.
///
/// ```rust,ignore
/// let tag = FnServerInterceptor::new(|call: ServerCall, next: Next| async move {
///     let mut reply = next.run(call).await?;
///     reply.metadata.append("x-served-by", "wirecall").ok();
///     Ok(reply)
/// });
/// ```
pub struct FnServerInterceptor<F> {
    f: F,
}

impl<F> FnServerInterceptor<F> {
    pub fn new<Fut>(f: F) -> Self
    where
        F: Fn(ServerCall, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ServerReply, Status>> + Send + 'static,
    {
        Self { f }
    }
}

impl<F, Fut> ServerInterceptor for FnServerInterceptor<F>
where
    F: Fn(ServerCall, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ServerReply, Status>> + Send + 'static,
{
    fn intercept(&self, call: ServerCall, next: Next) -> BoxFuture<'static, Result<ServerReply, Status>> {
        Box::pin((self.f)(call, next))
    }
}

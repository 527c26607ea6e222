//! Client interceptors.
//!
//! An interceptor wraps the function that sends a call, so it can rewrite
//! the outgoing call, inspect the result, or answer without reaching the
//! network at all. A channel composes its [`InterceptorChain`] once, when it
//! is built; `[A, B]` runs A, then B, then the transport.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use wirecall_client::{DefaultTimeout, InterceptorChain, MetadataInterceptor};
//!
//! let chain = InterceptorChain::new()
//!     .with(MetadataInterceptor::new("x-tenant", "acme").unwrap())
//!     .with(DefaultTimeout(Duration::from_secs(5)));
//! assert_eq!(chain.len(), 2);
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use wirecall_core::{Codec, Metadata, MetadataError, MetadataValue, MethodPath};

use crate::ClientError;
use crate::frame::FrameStream;

/// Type alias for a boxed future returning a result.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What interceptors know about a call.
#[derive(Debug, Clone)]
pub struct CallDetails {
    method: MethodPath,
    /// Outgoing request metadata. Call credentials have already been applied.
    pub metadata: Metadata,
    deadline: Option<Instant>,
    codec: Codec,
}

impl CallDetails {
    pub(crate) fn new(method: MethodPath, metadata: Metadata, deadline: Option<Instant>, codec: Codec) -> Self {
        Self {
            method,
            metadata,
            deadline,
            codec,
        }
    }

    pub fn method(&self) -> &MethodPath {
        &self.method
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Give the call a deadline unless it already has one.
    ///
    /// Returns whether the deadline was set. A deadline, once present, is
    /// never moved.
    pub fn set_deadline_if_absent(&mut self, deadline: Instant) -> bool {
        if self.deadline.is_some() {
            return false;
        }
        self.deadline = Some(deadline);
        true
    }
}

/// An outgoing call: its details and the encoded request message.
#[derive(Debug, Clone)]
pub struct ClientCall {
    pub details: CallDetails,
    pub body: Bytes,
}

/// Result of a unary call before the response message is decoded.
#[derive(Debug, Clone, Default)]
pub struct UnaryResponse {
    pub metadata: Metadata,
    pub trailers: Metadata,
    pub body: Bytes,
}

/// Result of starting a server-streaming call.
pub struct StreamingResponse {
    /// Leading metadata from the response headers.
    pub metadata: Metadata,
    pub frames: FrameStream,
}

impl std::fmt::Debug for StreamingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingResponse")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// The signature of a unary call.
pub type UnaryFunc =
    Arc<dyn Fn(ClientCall) -> BoxFuture<'static, Result<UnaryResponse, ClientError>> + Send + Sync>;

/// The signature of a server-streaming call.
pub type StreamingFunc =
    Arc<dyn Fn(ClientCall) -> BoxFuture<'static, Result<StreamingResponse, ClientError>> + Send + Sync>;

/// The rest of the chain, as seen by a [`FnInterceptor`].
#[derive(Clone)]
pub struct UnaryNext {
    inner: UnaryFunc,
}

impl UnaryNext {
    pub async fn call(self, call: ClientCall) -> Result<UnaryResponse, ClientError> {
        (self.inner)(call).await
    }
}

/// Wraps the calls of a channel.
///
/// Both methods default to passing `next` through unchanged.
pub trait Interceptor: Send + Sync {
    fn wrap_unary(&self, next: UnaryFunc) -> UnaryFunc {
        next
    }

    fn wrap_streaming(&self, next: StreamingFunc) -> StreamingFunc {
        next
    }
}

/// Ordered list of interceptors.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl std::fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("count", &self.interceptors.len())
            .finish()
    }
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.push(interceptor);
    }

    pub fn with<I: Interceptor + 'static>(mut self, interceptor: I) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    /// Wrap `next` so the first interceptor pushed runs first.
    pub fn wrap_unary(&self, next: UnaryFunc) -> UnaryFunc {
        self.interceptors
            .iter()
            .rev()
            .fold(next, |wrapped, interceptor| interceptor.wrap_unary(wrapped))
    }

    pub fn wrap_streaming(&self, next: StreamingFunc) -> StreamingFunc {
        self.interceptors
            .iter()
            .rev()
            .fold(next, |wrapped, interceptor| interceptor.wrap_streaming(wrapped))
    }
}

/// Appends a fixed metadata pair to every call.
#[derive(Debug, Clone)]
pub struct MetadataInterceptor {
    key: String,
    value: MetadataValue,
}

impl MetadataInterceptor {
    /// Fails if the pair could never be sent, e.g. a reserved or uppercase key.
    pub fn new<K, V>(key: K, value: V) -> Result<Self, MetadataError>
    where
        K: Into<String>,
        V: Into<MetadataValue>,
    {
        let key = key.into();
        let value = value.into();
        Metadata::new().append(key.clone(), value.clone())?;
        Ok(Self { key, value })
    }

    fn apply(&self, details: &mut CallDetails) {
        // Validated in `new`.
        let _ = details.metadata.append(self.key.clone(), self.value.clone());
    }
}

impl Interceptor for MetadataInterceptor {
    fn wrap_unary(&self, next: UnaryFunc) -> UnaryFunc {
        let this = self.clone();
        Arc::new(move |mut call: ClientCall| {
            this.apply(&mut call.details);
            next(call)
        })
    }

    fn wrap_streaming(&self, next: StreamingFunc) -> StreamingFunc {
        let this = self.clone();
        Arc::new(move |mut call: ClientCall| {
            this.apply(&mut call.details);
            next(call)
        })
    }
}

/// Gives calls without a deadline one that far in the future.
#[derive(Debug, Clone, Copy)]
pub struct DefaultTimeout(pub Duration);

impl DefaultTimeout {
    fn apply(&self, details: &mut CallDetails) {
        if let Some(deadline) = Instant::now().checked_add(self.0) {
            details.set_deadline_if_absent(deadline);
        }
    }
}

impl Interceptor for DefaultTimeout {
    fn wrap_unary(&self, next: UnaryFunc) -> UnaryFunc {
        let this = *self;
        Arc::new(move |mut call: ClientCall| {
            this.apply(&mut call.details);
            next(call)
        })
    }

    fn wrap_streaming(&self, next: StreamingFunc) -> StreamingFunc {
        let this = *self;
        Arc::new(move |mut call: ClientCall| {
            this.apply(&mut call.details);
            next(call)
        })
    }
}

/// A unary interceptor built from a closure.
///
/// ```
/// use wirecall_client::{ClientCall, FnInterceptor, UnaryNext};
///
/// let log = FnInterceptor::unary(|call: ClientCall, next: UnaryNext| {
///     Box::pin(async move {
///         let method = call.details.method().clone();
///         let result = next.call(call).await;
///         println!("{method}: ok={}", result.is_ok());
///         result
///     })
/// });
/// # let _ = log;
/// ```
#[derive(Clone)]
pub struct FnInterceptor<F> {
    func: F,
}

impl<F> FnInterceptor<F>
where
    F: Fn(ClientCall, UnaryNext) -> BoxFuture<'static, Result<UnaryResponse, ClientError>>
        + Send
        + Sync
        + Clone
        + 'static,
{
    pub fn unary(func: F) -> Self {
        Self { func }
    }
}

impl<F> Interceptor for FnInterceptor<F>
where
    F: Fn(ClientCall, UnaryNext) -> BoxFuture<'static, Result<UnaryResponse, ClientError>>
        + Send
        + Sync
        + Clone
        + 'static,
{
    fn wrap_unary(&self, next: UnaryFunc) -> UnaryFunc {
        let func = self.func.clone();
        Arc::new(move |call: ClientCall| {
            let next = UnaryNext { inner: next.clone() };
            func(call, next)
        })
    }
}

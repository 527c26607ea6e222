//! Handler-facing request and response types.

use std::net::SocketAddr;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use wirecall_core::{Metadata, MethodPath};

/// Per-call information available to interceptors and handlers.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub(crate) method: MethodPath,
    pub(crate) metadata: Metadata,
    pub(crate) deadline: Option<Instant>,
    pub(crate) cancellation: CancellationToken,
    pub(crate) peer: Option<SocketAddr>,
}

impl CallContext {
    pub fn new(method: MethodPath) -> Self {
        Self {
            method,
            metadata: Metadata::new(),
            deadline: None,
            cancellation: CancellationToken::new(),
            peer: None,
        }
    }

    pub fn method(&self) -> &MethodPath {
        &self.method
    }

    /// Metadata sent by the client.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    /// Effective deadline: the tighter of the client's timeout and the
    /// server's `max_timeout`.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancelled when the client goes away, the deadline passes, or the
    /// server forcibly stops. Handlers observe it at their await points.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }
}

/// A decoded request message with its call context.
#[derive(Debug)]
pub struct Request<T> {
    message: T,
    context: CallContext,
}

impl<T> Request<T> {
    pub fn new(message: T, context: CallContext) -> Self {
        Self { message, context }
    }

    pub fn message(&self) -> &T {
        &self.message
    }

    pub fn into_message(self) -> T {
        self.message
    }

    pub fn metadata(&self) -> &Metadata {
        &self.context.metadata
    }

    pub fn context(&self) -> &CallContext {
        &self.context
    }

    pub fn into_parts(self) -> (T, CallContext) {
        (self.message, self.context)
    }
}

/// A handler's successful result: the message (or stream of messages) plus
/// leading and trailing metadata.
#[derive(Debug)]
pub struct Response<T> {
    message: T,
    metadata: Metadata,
    trailers: Metadata,
}

impl<T> Response<T> {
    pub fn new(message: T) -> Self {
        Self {
            message,
            metadata: Metadata::new(),
            trailers: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_trailers(mut self, trailers: Metadata) -> Self {
        self.trailers = trailers;
        self
    }

    pub fn message(&self) -> &T {
        &self.message
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    pub fn trailers_mut(&mut self) -> &mut Metadata {
        &mut self.trailers
    }

    pub fn into_parts(self) -> (T, Metadata, Metadata) {
        (self.message, self.metadata, self.trailers)
    }
}

impl<T> From<T> for Response<T> {
    fn from(message: T) -> Self {
        Self::new(message)
    }
}

//! Client for wirecall servers.
//!
//! A [`Channel`] points at one server. It builds its HTTP transport lazily,
//! reports a [`ConnectivityState`], and runs unary and server-streaming
//! calls through its [`InterceptorChain`].
//!
//! ## Features
//!
//! - Unary calls, awaited directly or driven through a cancellable [`UnaryCall`]
//! - Server-streaming calls as a [`ResponseStream`] with headers and trailers
//! - Protobuf and JSON encoding
//! - Deadlines, cancellation tokens and per-call metadata via [`CallOptions`]
//! - TLS and mutual TLS through [`ChannelCredentials`], plus per-call
//!   [`CallCredentials`]
//! - Opt-in retries with exponential backoff
//!
//! ## Server Streaming Example
//!
//! ```ignore
//! use futures::StreamExt;
//! use wirecall_client::{CallOptions, Channel};
//!
//! let channel = Channel::insecure("localhost:50051")?;
//! let mut stream = channel
//!     .streaming_call::<CountRequest, Tick>("/demo.Counter/Count", &request, CallOptions::new())
//!     .await?;
//!
//! while let Some(tick) = stream.next().await {
//!     println!("{:?}", tick?);
//! }
//! println!("trailers: {:?}", stream.trailers());
//! ```
//!
//! ## Cancellation
//!
//! A stream can be stopped with [`ResponseStream::cancel`]; it then yields
//! no further items and reports CANCELLED. Dropping a stream also ends the
//! call, which resets the HTTP exchange for the server. A
//! [`CancellationToken`](tokio_util::sync::CancellationToken) passed in
//! [`CallOptions::cancellation`] cancels the call from anywhere.

pub mod call;
pub mod channel;
pub mod credentials;
mod error;
pub mod frame;
pub mod interceptor;
pub mod options;
pub mod retry;
mod transport;

pub use call::{CallState, Response, ResponseStream, UnaryCall};
pub use channel::{Channel, ConnectivityState};
pub use credentials::{AuthContext, CallCredentials, ChannelCredentials, TlsCredentials};
pub use error::ClientError;
pub use frame::FrameStream;
pub use interceptor::{
    BoxFuture, CallDetails, ClientCall, DefaultTimeout, FnInterceptor, Interceptor, InterceptorChain,
    MetadataInterceptor, StreamingFunc, StreamingResponse, UnaryFunc, UnaryNext, UnaryResponse,
};
pub use options::{CallOptions, ChannelOptions, LbPolicy};
pub use retry::{ExponentialBackoff, RetryPolicy, retry, retry_with_policy};

pub use wirecall_core::{Code, Codec, EndStream, ErrorDetail, Frame, MessageLimits, Metadata, MetadataValue, Status};

pub use tokio_util::sync::CancellationToken;

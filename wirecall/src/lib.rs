//! # wirecall
//!
//! An RPC server for unary and server-streaming calls over HTTP, built on
//! [Axum](https://github.com/tokio-rs/axum).
//!
//! Calls are `POST /{service}/{method}` with protobuf or JSON bodies. Each
//! call runs on a bounded worker pool, passes through the server's
//! interceptor chain, and observes its deadline and cancellation.
//!
//! ## Features
//!
//! - **Typed handlers:** plain `async fn(Request<Req>) -> Result<Response<Res>, Status>`.
//! - **Bounded concurrency:** `max_workers` running handlers and an optional
//!   `max_queued` waiting room; overflow fails with `RESOURCE_EXHAUSTED`.
//! - **Interceptors:** composed once per method when the server is built.
//! - **Graceful shutdown:** in-flight calls get a grace period and are
//!   cancelled after it.
//!
//! ```rust,ignore
//! let handle = Server::builder()
//!     .unary("/greet.Greeter/SayHello", say_hello)
//!     .build()?
//!     .start("127.0.0.1:50051")
//!     .await?;
//! handle.graceful_stop(Duration::from_secs(5)).await;
//! ```

mod dispatch;
pub mod error;
pub mod handler;
pub mod interceptor;
mod pool;
pub mod request;
pub mod server;

pub use wirecall_core as core;

// Re-export several crates
pub use futures;
pub use prost;
pub use serde;

pub mod prelude {
    //! The most common types for writing a service.
    pub use crate::error::ServerError;
    pub use crate::handler::MethodKind;
    pub use crate::interceptor::{
        FnServerInterceptor, Next, RequireMetadata, ServerCall, ServerInterceptor, ServerReply, TraceInterceptor,
    };
    pub use crate::request::{CallContext, Request, Response};
    pub use crate::server::{Server, ServerBuilder, ServerHandle, ServerState};
    pub use wirecall_core::{Code, Codec, ErrorClass, Metadata, MetadataValue, MethodPath, Status};
}

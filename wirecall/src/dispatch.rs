//! Per-call dispatch: validation, admission, execution and response framing.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request};
use axum::response::Response;
use bytes::{Bytes, BytesMut};
use futures::{FutureExt, StreamExt};
use http::StatusCode;
use http::header::{CONTENT_TYPE, HeaderMap};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use tokio::sync::{OwnedSemaphorePermit, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tokio_util::task::TaskTracker;
use tokio_util::task::task_tracker::TaskTrackerToken;
use wirecall_core::{
    Codec, ENVELOPE_HEADER_SIZE, EndStream, ErrorClass, Frame, Framing, MessageLimits, Metadata, MethodPath,
    Status, TIMEOUT_HEADER, decode_frame, effective_timeout, envelope_flags, parse_content_type, parse_timeout,
    wrap_envelope,
};

use crate::error::{streaming_error, unary_error, unary_success};
use crate::handler::MethodKind;
use crate::interceptor::{Dispatch, ReplyBody, ReplyStream, ServerCall, ServerReply};
use crate::pool::{Admission, WorkerPool};
use crate::request::CallContext;
use crate::server::ServerState;

/// State shared by every connection of a running server.
pub(crate) struct Shared {
    pub(crate) state: watch::Sender<ServerState>,
    pub(crate) pool: WorkerPool,
    /// Parent of every call's cancellation token.
    pub(crate) calls: CancellationToken,
    pub(crate) tracker: TaskTracker,
    pub(crate) max_timeout: Option<Duration>,
    pub(crate) limits: MessageLimits,
}

impl Shared {
    pub(crate) fn is_serving(&self) -> bool {
        *self.state.borrow() == ServerState::Serving
    }
}

pub(crate) struct MethodEntry {
    pub(crate) path: MethodPath,
    pub(crate) kind: MethodKind,
    pub(crate) dispatch: Dispatch,
}

struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Everything a streaming body must keep alive until its last frame.
struct CallResources {
    _permit: OwnedSemaphorePermit,
    _tracked: TaskTrackerToken,
    _cancel_on_drop: DropGuard,
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn reject(kind: MethodKind, codec: Codec, status: Status) -> Response {
    match kind {
        MethodKind::Unary => unary_error(&status, &Metadata::new(), &Metadata::new()),
        MethodKind::ServerStreaming => streaming_error(status, codec, &Metadata::new()),
    }
}

fn request_codec(headers: &HeaderMap) -> Option<(Codec, Framing)> {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_content_type)
}

async fn read_payload(request: Request, kind: MethodKind, limits: &MessageLimits) -> Result<Bytes, Status> {
    let limit = limits.receive_limit().saturating_add(ENVELOPE_HEADER_SIZE);
    let body = Limited::new(request.into_body(), limit)
        .collect()
        .await
        .map_err(|e| {
            if e.downcast_ref::<LengthLimitError>().is_some() {
                Status::from_class(ErrorClass::Resource, "request message exceeds the size limit")
            } else {
                Status::cancelled(format!("failed to read request body: {e}"))
            }
        })?
        .to_bytes();

    let payload = match kind {
        MethodKind::Unary => body,
        MethodKind::ServerStreaming => {
            let mut buf = BytesMut::from(&body[..]);
            match decode_frame(&mut buf, limits.receive_limit()) {
                Ok(Some(Frame::Message(payload))) if buf.is_empty() => payload,
                Ok(_) => return Err(Status::invalid_argument("expected exactly one request message")),
                Err(e) => return Err(Status::invalid_argument(e.to_string())),
            }
        }
    };
    limits
        .check_receive(payload.len())
        .map_err(|msg| Status::from_class(ErrorClass::Resource, msg))?;
    Ok(payload)
}

pub(crate) async fn handle(shared: Arc<Shared>, entry: Arc<MethodEntry>, request: Request) -> Response {
    let started = Instant::now();
    let Some((codec, framing)) = request_codec(request.headers()) else {
        let mut response = unary_error(
            &Status::invalid_argument("unsupported content type"),
            &Metadata::new(),
            &Metadata::new(),
        );
        *response.status_mut() = StatusCode::UNSUPPORTED_MEDIA_TYPE;
        return response;
    };
    let kind = entry.kind;
    let expected = match kind {
        MethodKind::Unary => Framing::Unary,
        MethodKind::ServerStreaming => Framing::Streaming,
    };
    if framing != expected {
        let status = Status::invalid_argument(format!("{} is a {kind:?} method", entry.path));
        return reject(kind, codec, status);
    }
    if !shared.is_serving() {
        return reject(kind, codec, Status::unavailable("server is shutting down"));
    }
    let tracked = shared.tracker.token();

    let client_timeout = request.headers().get(TIMEOUT_HEADER).and_then(parse_timeout);
    let deadline = effective_timeout(shared.max_timeout, client_timeout).map(|t| started + t);
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let metadata = Metadata::from_headers(request.headers());

    let payload = match read_payload(request, kind, &shared.limits).await {
        Ok(payload) => payload,
        Err(status) => return reject(kind, codec, status),
    };

    let token = shared.calls.child_token();
    // Fires when this future is dropped, i.e. the client went away.
    let cancel_on_drop = token.clone().drop_guard();

    let permit = match shared.pool.admit() {
        Ok(Admission::Ready(permit)) => permit,
        Ok(Admission::Queued(slot)) => {
            tokio::select! {
                permit = shared.pool.wait(slot) => match permit {
                    Ok(permit) => permit,
                    Err(status) => return reject(kind, codec, status),
                },
                _ = deadline_elapsed(deadline) => {
                    return reject(kind, codec, Status::deadline_exceeded("deadline exceeded while queued"));
                }
                _ = token.cancelled() => {
                    return reject(kind, codec, Status::cancelled("call cancelled while queued"));
                }
            }
        }
        Err(status) => {
            tracing::debug!(method = %entry.path, queued = shared.pool.queued(), "rejecting call: {status}");
            return reject(kind, codec, status);
        }
    };

    let call = ServerCall {
        context: CallContext {
            method: entry.path.clone(),
            metadata,
            deadline,
            cancellation: token.clone(),
            peer,
        },
        codec,
        payload,
    };
    let dispatch = entry.dispatch.clone();
    let mut task = AbortOnDrop(shared.tracker.spawn(async move {
        let reply = dispatch(call).await;
        (reply, permit)
    }));

    let outcome = tokio::select! {
        biased;
        joined = &mut task.0 => match joined {
            Ok((reply, permit)) => reply.map(|reply| (reply, permit)),
            Err(e) if e.is_panic() => {
                tracing::warn!(method = %entry.path, "handler panicked");
                Err(Status::from_class(ErrorClass::Application, "handler panicked"))
            }
            Err(_) => Err(Status::cancelled("call was cancelled")),
        },
        _ = deadline_elapsed(deadline) => Err(Status::deadline_exceeded("deadline exceeded")),
        _ = token.cancelled() => Err(Status::cancelled("call was cancelled")),
    };
    let outcome = outcome.and_then(|ok| match deadline {
        Some(deadline) if Instant::now() >= deadline => {
            Err(Status::deadline_exceeded("deadline exceeded"))
        }
        _ => Ok(ok),
    });

    let (reply, permit) = match outcome {
        Ok(ok) => ok,
        Err(status) => {
            token.cancel();
            return reject(kind, codec, status);
        }
    };

    let ServerReply {
        metadata,
        trailers,
        body,
    } = reply;
    match (kind, body) {
        (MethodKind::Unary, ReplyBody::Unary(body)) => match shared.limits.check_send(body.len()) {
            Ok(()) => unary_success(codec, &metadata, &trailers, body),
            Err(msg) => reject(kind, codec, Status::from_class(ErrorClass::Resource, msg)),
        },
        (MethodKind::ServerStreaming, ReplyBody::Stream(stream)) => {
            let resources = CallResources {
                _permit: permit,
                _tracked: tracked,
                _cancel_on_drop: cancel_on_drop,
            };
            let body = stream_body(stream, trailers, deadline, token, shared.limits, resources);
            let mut response = Response::new(body);
            metadata.write_headers(response.headers_mut());
            response.headers_mut().insert(
                CONTENT_TYPE,
                http::HeaderValue::from_static(codec.streaming_content_type()),
            );
            response
        }
        _ => reject(kind, codec, Status::internal("handler reply does not match the method kind")),
    }
}

fn stream_body(
    stream: ReplyStream,
    trailers: Metadata,
    deadline: Option<Instant>,
    token: CancellationToken,
    limits: MessageLimits,
    resources: CallResources,
) -> Body {
    let frames = async_stream::stream! {
        let _resources = resources;
        let mut stream = stream;
        let end = loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    break EndStream::error(Status::cancelled("call was cancelled"), Metadata::new());
                }
                _ = deadline_elapsed(deadline) => {
                    break EndStream::error(Status::deadline_exceeded("deadline exceeded"), Metadata::new());
                }
                item = AssertUnwindSafe(stream.next()).catch_unwind() => match item {
                    Ok(item) => item,
                    Err(_) => {
                        tracing::warn!("streaming handler panicked");
                        break EndStream::error(
                            Status::from_class(ErrorClass::Application, "handler panicked"),
                            Metadata::new(),
                        );
                    }
                },
            };
            match next {
                Some(Ok(message)) => {
                    if let Err(msg) = limits.check_send(message.len()) {
                        break EndStream::error(Status::from_class(ErrorClass::Resource, msg), Metadata::new());
                    }
                    match wrap_envelope(&message, envelope_flags::MESSAGE) {
                        Ok(frame) => {
                            yield Ok::<Bytes, Infallible>(frame);
                        }
                        Err(e) => {
                            break EndStream::error(Status::from_class(ErrorClass::Resource, e.to_string()), Metadata::new());
                        }
                    }
                }
                Some(Err(status)) => break EndStream::error(status, trailers),
                None => break EndStream::ok(trailers),
            }
        };
        yield Ok(end.to_frame());
    };
    Body::from_stream(frames)
}

/// Fallback for paths with no registered method.
pub(crate) async fn unimplemented(shared: Arc<Shared>, request: Request) -> Response {
    let status = if shared.is_serving() {
        Status::from_class(
            ErrorClass::Routing,
            format!("method not found: {}", request.uri().path()),
        )
    } else {
        Status::unavailable("server is shutting down")
    };
    match request_codec(request.headers()) {
        Some((codec, Framing::Streaming)) => streaming_error(status, codec, &Metadata::new()),
        _ => unary_error(&status, &Metadata::new(), &Metadata::new()),
    }
}

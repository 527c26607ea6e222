//! Typed handlers and their erasure into [`Dispatch`] functions.

use std::future::Future;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use wirecall_core::{CodecError, ErrorClass, RpcMessage, Status};

use crate::interceptor::{Dispatch, ReplyBody, ServerCall, ServerReply, dispatch_fn};
use crate::request::{Request, Response};

/// How a method exchanges messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Unary,
    ServerStreaming,
}

fn request_decode_error(e: CodecError) -> Status {
    Status::invalid_argument(e.to_string())
}

fn response_encode_error(e: CodecError) -> Status {
    Status::from_class(ErrorClass::Serialization, e.to_string())
}

pub(crate) fn unary<Req, Res, F, Fut>(handler: F) -> Dispatch
where
    Req: RpcMessage,
    Res: RpcMessage,
    F: Fn(Request<Req>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<Res>, Status>> + Send + 'static,
{
    let handler = Arc::new(handler);
    dispatch_fn(move |call: ServerCall| {
        let handler = handler.clone();
        Box::pin(async move {
            let ServerCall {
                context,
                codec,
                payload,
            } = call;
            let message: Req = codec.decode(&payload).map_err(request_decode_error)?;
            let (message, metadata, trailers) = handler(Request::new(message, context)).await?.into_parts();
            let body = codec.encode(&message).map_err(response_encode_error)?;
            Ok::<_, Status>(ServerReply {
                metadata,
                trailers,
                body: ReplyBody::Unary(body),
            })
        })
    })
}

pub(crate) fn server_streaming<Req, Res, S, F, Fut>(handler: F) -> Dispatch
where
    Req: RpcMessage,
    Res: RpcMessage,
    S: Stream<Item = Result<Res, Status>> + Send + 'static,
    F: Fn(Request<Req>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<S>, Status>> + Send + 'static,
{
    let handler = Arc::new(handler);
    dispatch_fn(move |call: ServerCall| {
        let handler = handler.clone();
        Box::pin(async move {
            let ServerCall {
                context,
                codec,
                payload,
            } = call;
            let message: Req = codec.decode(&payload).map_err(request_decode_error)?;
            let (stream, metadata, trailers) = handler(Request::new(message, context)).await?.into_parts();
            let encoded = stream.map(move |item| {
                item.and_then(|message| codec.encode(&message).map_err(response_encode_error))
            });
            Ok::<_, Status>(ServerReply {
                metadata,
                trailers,
                body: ReplyBody::Stream(Box::pin(encoded)),
            })
        })
    })
}

//! Call handles and their lifecycle.
//!
//! Every call started on a channel gets a [`CallRecord`] registered with the
//! channel. The record tracks the call through
//! `Pending -> Active -> {Completed, Cancelled, Failed}`; the first terminal
//! state wins and later outcomes are ignored. The record's cancellation
//! token is a child of the channel's, so closing the channel interrupts
//! every call still running.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, ready};

use futures::Stream;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use wirecall_core::{Code, Codec, Frame, Metadata, RpcMessage, Status};

use crate::ClientError;
use crate::frame::FrameStream;
use crate::interceptor::BoxFuture;

/// Where a call is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallState {
    /// Created, not yet handed to the transport.
    Pending,
    Active,
    Completed,
    Cancelled,
    Failed,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Completed | CallState::Cancelled | CallState::Failed)
    }
}

#[derive(Debug)]
struct Outcome {
    state: CallState,
    status: Option<Status>,
}

/// Shared lifecycle state of one call.
#[derive(Debug)]
pub(crate) struct CallRecord {
    outcome: Mutex<Outcome>,
    token: CancellationToken,
}

impl CallRecord {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self {
            outcome: Mutex::new(Outcome {
                state: CallState::Pending,
                status: None,
            }),
            token,
        }
    }

    /// A record that failed before it could start.
    pub(crate) fn failed(status: Status) -> Self {
        let record = Self::new(CancellationToken::new());
        record.finish(CallState::Failed, status);
        record
    }

    fn lock(&self) -> MutexGuard<'_, Outcome> {
        self.outcome.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> CallState {
        self.lock().state
    }

    pub(crate) fn status(&self) -> Option<Status> {
        self.lock().status.clone()
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn activate(&self) {
        let mut outcome = self.lock();
        if outcome.state == CallState::Pending {
            outcome.state = CallState::Active;
        }
    }

    /// Move to a terminal state. Returns false if the call had already ended.
    pub(crate) fn finish(&self, state: CallState, status: Status) -> bool {
        let mut outcome = self.lock();
        if outcome.state.is_terminal() {
            return false;
        }
        outcome.state = state;
        outcome.status = Some(status);
        true
    }

    /// Record the result of the call's work.
    pub(crate) fn settle<T>(&self, result: &Result<T, ClientError>) {
        match result {
            Ok(_) => self.finish(CallState::Completed, Status::from_code(Code::Ok)),
            Err(e) if e.code() == Code::Canceled => self.finish(CallState::Cancelled, e.to_status()),
            Err(e) => self.finish(CallState::Failed, e.to_status()),
        };
    }

    pub(crate) fn cancel(&self) {
        self.finish(CallState::Cancelled, Status::cancelled("call cancelled"));
        self.token.cancel();
    }

    /// The error seen by a caller whose call was interrupted.
    pub(crate) fn interruption(&self) -> ClientError {
        match self.status() {
            Some(status) if !status.is_ok() => ClientError::Status(status),
            _ => ClientError::cancelled("call cancelled"),
        }
    }

    async fn interruptible<T, F>(&self, user: Option<CancellationToken>, work: F) -> Result<T, ClientError>
    where
        F: Future<Output = Result<T, ClientError>>,
    {
        self.activate();
        let user_cancelled = async {
            match user {
                Some(token) => token.cancelled_owned().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(self.interruption()),
            _ = user_cancelled => {
                self.cancel();
                Err(self.interruption())
            }
            result = work => result,
        }
    }

    /// Run `work` until it finishes or the call is interrupted, then settle
    /// the record with the outcome.
    pub(crate) async fn run<T, F>(&self, user: Option<CancellationToken>, work: F) -> Result<T, ClientError>
    where
        F: Future<Output = Result<T, ClientError>>,
    {
        let result = self.interruptible(user, work).await;
        self.settle(&result);
        result
    }

    /// Like [`CallRecord::run`], but success leaves the call active: the
    /// call continues after `work`, as a stream does after its headers.
    pub(crate) async fn start<T, F>(&self, user: Option<CancellationToken>, work: F) -> Result<T, ClientError>
    where
        F: Future<Output = Result<T, ClientError>>,
    {
        let result = self.interruptible(user, work).await;
        if result.is_err() {
            self.settle(&result);
        }
        result
    }
}

/// Live calls of a channel.
#[derive(Debug, Default)]
pub(crate) struct CallRegistry {
    next_id: AtomicU64,
    calls: Mutex<HashMap<u64, Arc<CallRecord>>>,
}

impl CallRegistry {
    fn calls(&self) -> MutexGuard<'_, HashMap<u64, Arc<CallRecord>>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(self: &Arc<Self>, parent: &CancellationToken) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = Arc::new(CallRecord::new(parent.child_token()));
        self.calls().insert(id, record.clone());
        Registration {
            id,
            record,
            registry: self.clone(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.calls().len()
    }

    /// End every live call with `status` and interrupt it.
    pub(crate) fn fail_all(&self, status: &Status) {
        let records: Vec<_> = self.calls().values().cloned().collect();
        for record in records {
            record.finish(CallState::Failed, status.clone());
            record.token.cancel();
        }
    }
}

/// A call's slot in the registry; removed on drop.
#[derive(Debug)]
pub(crate) struct Registration {
    id: u64,
    record: Arc<CallRecord>,
    registry: Arc<CallRegistry>,
}

impl Registration {
    pub(crate) fn record(&self) -> &Arc<CallRecord> {
        &self.record
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.calls().remove(&self.id);
    }
}

/// A decoded response with its metadata.
#[derive(Debug, Clone, Default, PartialEq)]
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

    pub(crate) fn with_metadata(message: T, metadata: Metadata, trailers: Metadata) -> Self {
        Self {
            message,
            metadata,
            trailers,
        }
    }

    pub fn get_ref(&self) -> &T {
        &self.message
    }

    /// Leading metadata.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn trailers(&self) -> &Metadata {
        &self.trailers
    }

    pub fn into_inner(self) -> T {
        self.message
    }

    pub fn into_parts(self) -> (Metadata, T, Metadata) {
        (self.metadata, self.message, self.trailers)
    }
}

/// A unary call in progress.
///
/// Await it for the response. The call runs only while it is polled;
/// [`UnaryCall::cancel`] ends it with CANCELLED from anywhere that holds a
/// reference.
pub struct UnaryCall<T> {
    record: Arc<CallRecord>,
    future: BoxFuture<'static, Result<Response<T>, ClientError>>,
}

impl<T: Send + 'static> UnaryCall<T> {
    pub(crate) fn new(record: Arc<CallRecord>, future: BoxFuture<'static, Result<Response<T>, ClientError>>) -> Self {
        Self { record, future }
    }

    /// A call that failed before it started.
    pub(crate) fn failed(err: ClientError) -> Self {
        let record = Arc::new(CallRecord::failed(err.to_status()));
        Self {
            record,
            future: Box::pin(std::future::ready(Err(err))),
        }
    }
}

impl<T> UnaryCall<T> {
    pub fn state(&self) -> CallState {
        self.record.state()
    }

    /// Final status, once the call has ended.
    pub fn status(&self) -> Option<Status> {
        self.record.status()
    }

    pub fn cancel(&self) {
        self.record.cancel();
    }
}

impl<T> std::fmt::Debug for UnaryCall<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnaryCall")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<T> Future for UnaryCall<T> {
    type Output = Result<Response<T>, ClientError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().future.as_mut().poll(cx)
    }
}

/// Responses of a server-streaming call, in the order the server sent them.
///
/// The stream ends with `None` after the server's OK end-of-stream, or
/// yields a single error and then ends. After [`ResponseStream::cancel`] it
/// yields nothing more and the call's status is CANCELLED.
pub struct ResponseStream<T> {
    registration: Registration,
    headers: Metadata,
    trailers: Metadata,
    frames: Option<FrameStream>,
    interrupted: Pin<Box<WaitForCancellationFutureOwned>>,
    user: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
    codec: Codec,
    done: bool,
    _message: PhantomData<fn() -> T>,
}

impl<T> ResponseStream<T> {
    pub(crate) fn new(
        registration: Registration,
        headers: Metadata,
        frames: FrameStream,
        codec: Codec,
        user: Option<CancellationToken>,
    ) -> Self {
        let interrupted = Box::pin(registration.record().token().clone().cancelled_owned());
        Self {
            registration,
            headers,
            trailers: Metadata::new(),
            frames: Some(frames),
            interrupted,
            user: user.map(|token| Box::pin(token.cancelled_owned())),
            codec,
            done: false,
            _message: PhantomData,
        }
    }

    fn record(&self) -> &CallRecord {
        self.registration.record()
    }

    pub fn state(&self) -> CallState {
        self.record().state()
    }

    /// Final status, once the stream has ended.
    pub fn status(&self) -> Option<Status> {
        self.record().status()
    }

    /// Leading metadata from the response headers.
    pub fn headers(&self) -> &Metadata {
        &self.headers
    }

    /// Trailing metadata; empty until the stream has ended.
    pub fn trailers(&self) -> &Metadata {
        &self.trailers
    }

    /// Stop the call. The HTTP exchange is dropped, which resets it for the
    /// server.
    pub fn cancel(&mut self) {
        if self.done {
            return;
        }
        self.record().cancel();
        self.frames = None;
        self.done = true;
    }

    fn end_with(&mut self, err: ClientError) -> Poll<Option<Result<T, ClientError>>> {
        self.record().settle::<()>(&Err(err.clone()));
        self.frames = None;
        self.done = true;
        Poll::Ready(Some(Err(err)))
    }

    fn interrupt(&mut self) -> Poll<Option<Result<T, ClientError>>> {
        let err = self.record().interruption();
        self.end_with(err)
    }
}

impl<T> std::fmt::Debug for ResponseStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseStream")
            .field("state", &self.state())
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl<T: RpcMessage> Stream for ResponseStream<T> {
    type Item = Result<T, ClientError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        if this.interrupted.as_mut().poll(cx).is_ready() {
            return this.interrupt();
        }
        if let Some(user) = this.user.as_mut() {
            if user.as_mut().poll(cx).is_ready() {
                this.record().cancel();
                return this.interrupt();
            }
        }
        let Some(frames) = this.frames.as_mut() else {
            this.done = true;
            return Poll::Ready(None);
        };
        this.registration.record().activate();

        match ready!(frames.as_mut().poll_next(cx)) {
            Some(Ok(Frame::Message(payload))) => match this.codec.decode::<T>(&payload) {
                Ok(message) => Poll::Ready(Some(Ok(message))),
                Err(e) => this.end_with(ClientError::decode(e)),
            },
            Some(Ok(Frame::End(end))) => {
                this.trailers = end.trailers;
                match end.status.filter(|s| !s.is_ok()) {
                    Some(status) => this.end_with(ClientError::Status(status)),
                    None => {
                        this.record().settle::<()>(&Ok(()));
                        this.frames = None;
                        this.done = true;
                        Poll::Ready(None)
                    }
                }
            }
            Some(Err(e)) => this.end_with(e),
            None => this.end_with(ClientError::Protocol(
                "response ended without an end-of-stream message".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use wirecall_core::EndStream;

    #[derive(Clone, PartialEq, prost::Message, serde::Serialize, serde::Deserialize)]
    struct Tick {
        #[prost(uint32, tag = "1")]
        n: u32,
    }

    fn frames(items: Vec<Result<Frame, ClientError>>) -> FrameStream {
        Box::pin(futures::stream::iter(items))
    }

    fn tick(n: u32) -> Result<Frame, ClientError> {
        Ok(Frame::Message(Codec::Json.encode(&Tick { n }).unwrap()))
    }

    fn stream_over(items: Vec<Result<Frame, ClientError>>) -> (Arc<CallRegistry>, ResponseStream<Tick>) {
        let registry = Arc::new(CallRegistry::default());
        let registration = registry.register(&CancellationToken::new());
        let stream = ResponseStream::new(registration, Metadata::new(), frames(items), Codec::Json, None);
        (registry, stream)
    }

    #[test]
    fn test_first_terminal_state_wins() {
        let record = CallRecord::new(CancellationToken::new());
        assert_eq!(record.state(), CallState::Pending);
        record.activate();
        assert_eq!(record.state(), CallState::Active);
        assert!(record.finish(CallState::Failed, Status::unavailable("closed")));
        record.cancel();
        assert_eq!(record.state(), CallState::Failed);
        assert_eq!(record.interruption().code(), Code::Unavailable);
        assert!(record.token().is_cancelled());
    }

    #[test]
    fn test_registration_is_removed_on_drop() {
        let registry = Arc::new(CallRegistry::default());
        let parent = CancellationToken::new();
        let a = registry.register(&parent);
        let b = registry.register(&parent);
        assert_eq!(registry.len(), 2);
        drop(a);
        assert_eq!(registry.len(), 1);

        registry.fail_all(&Status::unavailable("channel closed"));
        assert_eq!(b.record().state(), CallState::Failed);
        assert!(b.record().token().is_cancelled());
    }

    #[tokio::test]
    async fn test_run_settles_outcome() {
        let record = CallRecord::new(CancellationToken::new());
        let value = record.run(None, async { Ok::<_, ClientError>(7) }).await.unwrap();
        assert_eq!(value, 7);
        assert_eq!(record.state(), CallState::Completed);

        let record = CallRecord::new(CancellationToken::new());
        let err = record
            .run(None, async { Err::<(), _>(ClientError::not_found("missing")) })
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
        assert_eq!(record.state(), CallState::Failed);
        assert_eq!(record.status().unwrap().code(), Code::NotFound);
    }

    #[tokio::test]
    async fn test_run_stops_on_user_cancellation() {
        let record = CallRecord::new(CancellationToken::new());
        let user = CancellationToken::new();
        user.cancel();
        let err = record
            .run(Some(user), std::future::pending::<Result<(), ClientError>>())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Canceled);
        assert_eq!(record.state(), CallState::Cancelled);
    }

    #[tokio::test]
    async fn test_unary_call_cancel() {
        let registry = Arc::new(CallRegistry::default());
        let registration = registry.register(&CancellationToken::new());
        let record = registration.record().clone();
        let work = async move {
            let record = registration.record().clone();
            record
                .run(None, std::future::pending::<Result<Response<Tick>, ClientError>>())
                .await
        };
        let call = UnaryCall::new(record, Box::pin(work));
        call.cancel();
        assert_eq!(call.state(), CallState::Cancelled);
        let err = call.await.unwrap_err();
        assert_eq!(err.code(), Code::Canceled);
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn test_stream_yields_messages_then_trailers() {
        let mut trailers = Metadata::new();
        trailers.append("x-total", "2").unwrap();
        let (_registry, mut stream) = stream_over(vec![tick(1), tick(2), Ok(Frame::End(EndStream::ok(trailers)))]);

        let ticks: Vec<_> = (&mut stream).map(|t| t.unwrap().n).collect().await;
        assert_eq!(ticks, [1, 2]);
        assert_eq!(stream.state(), CallState::Completed);
        assert_eq!(stream.trailers().get_str("x-total"), Some("2"));
    }

    #[tokio::test]
    async fn test_stream_error_status_ends_stream() {
        let end = EndStream::error(Status::aborted("conflict"), Metadata::new());
        let (_registry, mut stream) = stream_over(vec![tick(1), Ok(Frame::End(end))]);

        assert_eq!(stream.next().await.unwrap().unwrap().n, 1);
        assert_eq!(stream.next().await.unwrap().unwrap_err().code(), Code::Aborted);
        assert!(stream.next().await.is_none());
        assert_eq!(stream.state(), CallState::Failed);
    }

    #[tokio::test]
    async fn test_cancelled_stream_ends_quietly() {
        let (registry, mut stream) = stream_over(vec![tick(1), tick(2), tick(3)]);
        assert_eq!(stream.next().await.unwrap().unwrap().n, 1);
        stream.cancel();
        assert!(stream.next().await.is_none());
        assert_eq!(stream.state(), CallState::Cancelled);
        assert_eq!(stream.status().unwrap().code(), Code::Canceled);
        drop(stream);
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn test_channel_shutdown_interrupts_stream() {
        let (registry, mut stream) = stream_over(vec![tick(1)]);
        registry.fail_all(&Status::unavailable("channel closed"));
        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);
        assert!(stream.next().await.is_none());
        assert_eq!(stream.state(), CallState::Failed);
    }

    #[tokio::test]
    async fn test_undecodable_message_is_internal() {
        let (_registry, mut stream) = stream_over(vec![Ok(Frame::Message(bytes::Bytes::from_static(b"{nope")))]);
        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert_eq!(stream.state(), CallState::Failed);
    }
}

//! Decoding of streaming response bodies into envelopes.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Bytes, BytesMut};
use futures::Stream;
use http_body::Body;
use tokio::time::{Instant, Sleep};
use wirecall_core::{Frame, decode_frame};

use crate::ClientError;

/// Envelopes of a streaming response, ending with [`Frame::End`] or an error.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, ClientError>> + Send>>;

/// Splits a response body into envelopes.
///
/// The stream yields every message envelope, then either the EndStream
/// envelope or a single error, then ends. A body that closes without an
/// EndStream envelope is a protocol error. When a deadline is given, the
/// stream fails with `DEADLINE_EXCEEDED` once it passes, including when the
/// EndStream envelope arrives late.
pub(crate) struct FrameDecoder<B> {
    body: B,
    buffer: BytesMut,
    max_size: usize,
    deadline: Option<Instant>,
    sleep: Option<Pin<Box<Sleep>>>,
    finished: bool,
}

impl<B> FrameDecoder<B> {
    pub(crate) fn new(body: B, max_size: usize, deadline: Option<Instant>) -> Self {
        Self {
            body,
            buffer: BytesMut::new(),
            max_size,
            deadline,
            sleep: deadline.map(|d| Box::pin(tokio::time::sleep_until(d))),
            finished: false,
        }
    }

    fn fail(&mut self, err: ClientError) -> Poll<Option<Result<Frame, ClientError>>> {
        self.finished = true;
        Poll::Ready(Some(Err(err)))
    }
}

impl<B> Stream for FrameDecoder<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: std::fmt::Display,
{
    type Item = Result<Frame, ClientError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.finished {
                return Poll::Ready(None);
            }

            match decode_frame(&mut this.buffer, this.max_size) {
                Ok(Some(Frame::End(end))) => {
                    if this.deadline.is_some_and(|d| Instant::now() >= d) {
                        return this.fail(ClientError::deadline_exceeded("deadline exceeded"));
                    }
                    this.finished = true;
                    return Poll::Ready(Some(Ok(Frame::End(end))));
                }
                Ok(Some(frame)) => return Poll::Ready(Some(Ok(frame))),
                Ok(None) => {}
                Err(e) => return this.fail(e.into()),
            }

            if let Some(sleep) = this.sleep.as_mut() {
                if sleep.as_mut().poll(cx).is_ready() {
                    return this.fail(ClientError::deadline_exceeded("deadline exceeded"));
                }
            }

            match ready!(Pin::new(&mut this.body).poll_frame(cx)) {
                Some(Ok(frame)) => {
                    // HTTP trailers carry nothing for this protocol.
                    if let Ok(data) = frame.into_data() {
                        this.buffer.extend_from_slice(&data);
                    }
                }
                Some(Err(e)) => {
                    return this.fail(ClientError::Transport(format!("response body failed: {e}")));
                }
                None => {
                    return this.fail(ClientError::Protocol(
                        "response ended without an end-of-stream message".into(),
                    ));
                }
            }
        }
    }
}

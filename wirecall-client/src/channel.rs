//! Channels: a target, its credentials and options, and the calls made on it.
//!
//! ```no_run
//! use wirecall_client::{CallOptions, Channel};
//! # #[derive(Clone, PartialEq, prost::Message, serde::Serialize, serde::Deserialize)]
//! # struct HelloRequest { #[prost(string, tag = "1")] name: String }
//! # #[derive(Clone, PartialEq, prost::Message, serde::Serialize, serde::Deserialize)]
//! # struct HelloReply { #[prost(string, tag = "1")] message: String }
//!
//! # async fn run() -> Result<(), wirecall_client::ClientError> {
//! let channel = Channel::insecure("localhost:50051")?;
//! let request = HelloRequest { name: "you".into() };
//! let reply = channel
//!     .unary_call::<_, HelloReply>("/greet.Greeter/SayHello", &request, CallOptions::new())
//!     .await?;
//! println!("{}", reply.get_ref().message);
//! channel.close().await;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use http::uri::Authority;
use http::{Response as HttpResponse, StatusCode};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use wirecall_core::{
    Codec, Framing, Metadata, MethodPath, RpcMessage, Status, TIMEOUT_HEADER, encode_timeout, envelope_flags,
    parse_content_type, wrap_envelope,
};

use crate::ClientError;
use crate::call::{CallRegistry, Registration, Response, ResponseStream, UnaryCall};
use crate::credentials::{AuthContext, ChannelCredentials};
use crate::frame::FrameDecoder;
use crate::interceptor::{
    CallDetails, ClientCall, Interceptor, InterceptorChain, StreamingFunc, StreamingResponse, UnaryFunc,
    UnaryResponse,
};
use crate::options::{CallOptions, ChannelOptions};
use crate::transport::HyperTransport;

const PROTOCOL_VERSION_HEADER: &str = "connect-protocol-version";
const TRAILER_PREFIX: &str = "trailer-";

/// Connectivity of a channel's transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    /// No transport yet; the first call builds it.
    Idle,
    Connecting,
    Ready,
    /// The last request failed at the transport level. The next call
    /// tries again.
    TransientFailure,
    /// Closed for good.
    Shutdown,
}

struct Core {
    scheme: &'static str,
    authority: Authority,
    credentials: ChannelCredentials,
    options: ChannelOptions,
    transport: Mutex<Option<HyperTransport>>,
    state: watch::Sender<ConnectivityState>,
    closed: CancellationToken,
    calls: Arc<CallRegistry>,
}

impl Core {
    fn set_state(&self, next: ConnectivityState) {
        self.state.send_if_modified(|current| {
            if *current == ConnectivityState::Shutdown || *current == next {
                return false;
            }
            #[cfg(feature = "tracing")]
            tracing::debug!(from = ?*current, to = ?next, "channel state changed");
            *current = next;
            true
        });
    }

    /// The transport, built on first use. Concurrent first callers wait for
    /// the same establishment.
    async fn transport(&self) -> Result<HyperTransport, ClientError> {
        let mut slot = self.transport.lock().await;
        if self.closed.is_cancelled() {
            return Err(ClientError::unavailable("channel closed"));
        }
        if let Some(transport) = slot.as_ref() {
            return Ok(transport.clone());
        }
        self.set_state(ConnectivityState::Connecting);
        match HyperTransport::establish(&self.credentials, &self.options) {
            Ok(transport) => {
                *slot = Some(transport.clone());
                self.set_state(ConnectivityState::Ready);
                Ok(transport)
            }
            Err(e) => {
                self.set_state(ConnectivityState::TransientFailure);
                Err(e)
            }
        }
    }

    async fn send(&self, request: http::Request<Full<Bytes>>) -> Result<HttpResponse<Incoming>, ClientError> {
        let transport = self.transport().await?;
        match transport.request(request).await {
            Ok(response) => {
                self.set_state(ConnectivityState::Ready);
                Ok(response)
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(error = %e, authority = %self.authority, "transport failure");
                self.set_state(ConnectivityState::TransientFailure);
                Err(e)
            }
        }
    }

    fn http_request(&self, call: ClientCall, framing: Framing) -> Result<http::Request<Full<Bytes>>, ClientError> {
        let ClientCall { details, body } = call;
        let codec = details.codec();
        let (content_type, body) = match framing {
            Framing::Unary => (codec.unary_content_type(), body),
            Framing::Streaming => (
                codec.streaming_content_type(),
                wrap_envelope(&body, envelope_flags::MESSAGE)
                    .map_err(|e| ClientError::resource_exhausted(e.to_string()))?,
            ),
        };
        let uri = format!("{}://{}{}", self.scheme, self.authority, details.method());
        let mut request = http::Request::post(uri)
            .body(Full::new(body))
            .map_err(|e| ClientError::internal(format!("invalid request: {e}")))?;

        let headers = request.headers_mut();
        details.metadata.write_headers(headers);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        headers.insert(PROTOCOL_VERSION_HEADER, HeaderValue::from_static("1"));
        if let Ok(agent) = HeaderValue::from_str(&self.options.user_agent()) {
            headers.insert(USER_AGENT, agent);
        }
        if let Some(deadline) = details.deadline() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            headers.insert(TIMEOUT_HEADER, encode_timeout(remaining));
        }
        Ok(request)
    }

    async fn read_body(&self, body: Incoming) -> Result<Bytes, ClientError> {
        let limit = self.options.limits().receive_limit();
        let collected = Limited::new(body, limit).collect().await.map_err(|e| {
            if e.downcast_ref::<LengthLimitError>().is_some() {
                ClientError::resource_exhausted(format!("response message larger than {limit} bytes"))
            } else {
                ClientError::Transport(format!("response body failed: {e}"))
            }
        })?;
        Ok(collected.to_bytes())
    }

    async fn send_unary(&self, call: ClientCall) -> Result<UnaryResponse, ClientError> {
        let deadline = call.details.deadline();
        let codec = call.details.codec();
        let request = self.http_request(call, Framing::Unary)?;
        within_deadline(deadline, async {
            let response = self.send(request).await?;
            let (parts, body) = response.into_parts();
            let body = self.read_body(body).await?;
            if parts.status != StatusCode::OK {
                return Err(ClientError::from_response(parts.status, &body));
            }
            expect_content_type(&parts.headers, codec, Framing::Unary)?;
            let (metadata, trailers) = split_unary_headers(&parts.headers);
            Ok(UnaryResponse {
                metadata,
                trailers,
                body,
            })
        })
        .await
    }

    async fn send_streaming(&self, call: ClientCall) -> Result<StreamingResponse, ClientError> {
        let deadline = call.details.deadline();
        let codec = call.details.codec();
        let request = self.http_request(call, Framing::Streaming)?;
        within_deadline(deadline, async {
            let response = self.send(request).await?;
            let (parts, body) = response.into_parts();
            if parts.status != StatusCode::OK {
                let body = self.read_body(body).await?;
                return Err(ClientError::from_response(parts.status, &body));
            }
            expect_content_type(&parts.headers, codec, Framing::Streaming)?;
            let frames = FrameDecoder::new(body, self.options.limits().receive_limit(), deadline);
            Ok(StreamingResponse {
                metadata: Metadata::from_headers(&parts.headers),
                frames: Box::pin(frames),
            })
        })
        .await
    }
}

/// Run `work` under `deadline`. A result that arrives after the deadline
/// still counts as DEADLINE_EXCEEDED.
async fn within_deadline<T, F>(deadline: Option<Instant>, work: F) -> Result<T, ClientError>
where
    F: Future<Output = Result<T, ClientError>>,
{
    let Some(deadline) = deadline else {
        return work.await;
    };
    if Instant::now() >= deadline {
        return Err(ClientError::deadline_exceeded("deadline exceeded"));
    }
    match tokio::time::timeout_at(deadline, work).await {
        Ok(result) if Instant::now() < deadline => result,
        _ => Err(ClientError::deadline_exceeded("deadline exceeded")),
    }
}

fn expect_content_type(headers: &HeaderMap, codec: Codec, framing: Framing) -> Result<(), ClientError> {
    let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()).unwrap_or_default();
    match parse_content_type(content_type) {
        Some(found) if found == (codec, framing) => Ok(()),
        _ => Err(ClientError::Protocol(format!(
            "unexpected response content type `{content_type}`"
        ))),
    }
}

/// Split unary response headers into leading metadata and the
/// `trailer-`-prefixed trailers.
fn split_unary_headers(headers: &HeaderMap) -> (Metadata, Metadata) {
    let mut leading = HeaderMap::new();
    let mut trailing = HeaderMap::new();
    for (name, value) in headers {
        match name.as_str().strip_prefix(TRAILER_PREFIX) {
            Some(key) => {
                if let Ok(key) = HeaderName::from_bytes(key.as_bytes()) {
                    trailing.append(key, value.clone());
                }
            }
            None => {
                leading.append(name.clone(), value.clone());
            }
        }
    }
    (Metadata::from_headers(&leading), Metadata::from_headers(&trailing))
}

/// Parse `host:port` or `scheme://host[:port]` into an authority, checking
/// the scheme against the credentials.
fn parse_target(target: &str, credentials: &ChannelCredentials) -> Result<(&'static str, Authority), ClientError> {
    let scheme = credentials.scheme();
    let (given, rest) = match target.split_once("://") {
        Some((given, rest)) => (Some(given), rest),
        None => (None, target),
    };
    if let Some(given) = given {
        if !given.eq_ignore_ascii_case(scheme) {
            return Err(ClientError::invalid_argument(format!(
                "target `{target}` does not match {scheme} credentials"
            )));
        }
    }
    let rest = rest.trim_end_matches('/');
    let authority: Authority = rest
        .parse()
        .map_err(|e| ClientError::invalid_argument(format!("invalid target `{target}`: {e}")))?;
    if rest.contains('/') || authority.as_str().contains('@') {
        return Err(ClientError::invalid_argument(format!("invalid target `{target}`")));
    }
    if given.is_none() && authority.port_u16().is_none() {
        return Err(ClientError::invalid_argument(format!(
            "target `{target}` needs a port or a scheme"
        )));
    }
    Ok((scheme, authority))
}

struct Prepared {
    registration: Registration,
    call: ClientCall,
    cancellation: Option<CancellationToken>,
}

/// A handle to a server.
///
/// Cloning is cheap; clones share the transport, the connectivity state and
/// the set of live calls. The transport is built lazily by the first call
/// or by [`Channel::connect`].
#[derive(Clone)]
pub struct Channel {
    core: Arc<Core>,
    unary: UnaryFunc,
    streaming: StreamingFunc,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("target", &self.target())
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

impl Channel {
    pub fn open(
        target: &str,
        credentials: ChannelCredentials,
        options: ChannelOptions,
    ) -> Result<Self, ClientError> {
        credentials.validate()?;
        let (scheme, authority) = parse_target(target, &credentials)?;
        let (state, _) = watch::channel(ConnectivityState::Idle);
        let core = Arc::new(Core {
            scheme,
            authority,
            credentials,
            options,
            transport: Mutex::new(None),
            state,
            closed: CancellationToken::new(),
            calls: Arc::new(CallRegistry::default()),
        });

        let unary_core = core.clone();
        let unary: UnaryFunc = Arc::new(move |call: ClientCall| {
            let core = unary_core.clone();
            Box::pin(async move { core.send_unary(call).await })
        });
        let streaming_core = core.clone();
        let streaming: StreamingFunc = Arc::new(move |call: ClientCall| {
            let core = streaming_core.clone();
            Box::pin(async move { core.send_streaming(call).await })
        });
        Ok(Self {
            core,
            unary,
            streaming,
        })
    }

    /// Plaintext channel with default options.
    pub fn insecure(target: &str) -> Result<Self, ClientError> {
        Self::open(target, ChannelCredentials::insecure(), ChannelOptions::default())
    }

    /// A channel sharing this one's transport whose calls also pass through
    /// `chain`. The new interceptors run before the ones already installed.
    pub fn with_interceptors(&self, chain: InterceptorChain) -> Self {
        Self {
            core: self.core.clone(),
            unary: chain.wrap_unary(self.unary.clone()),
            streaming: chain.wrap_streaming(self.streaming.clone()),
        }
    }

    pub fn intercept<I: Interceptor + 'static>(&self, interceptor: I) -> Self {
        self.with_interceptors(InterceptorChain::new().with(interceptor))
    }

    /// `scheme://host:port` of the server.
    pub fn target(&self) -> String {
        format!("{}://{}", self.core.scheme, self.core.authority)
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.core.options
    }

    pub fn state(&self) -> ConnectivityState {
        *self.core.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectivityState> {
        self.core.state.subscribe()
    }

    /// Build the transport now instead of on the first call.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.core.transport().await.map(|_| ())
    }

    /// Calls started and not yet finished or dropped.
    pub fn in_flight(&self) -> usize {
        self.core.calls.len()
    }

    pub fn is_closed(&self) -> bool {
        self.core.closed.is_cancelled()
    }

    /// Shut the channel down.
    ///
    /// Live calls fail with UNAVAILABLE and new calls are refused. Calling
    /// it again does nothing.
    pub async fn close(&self) {
        let previous = self.core.state.send_replace(ConnectivityState::Shutdown);
        if previous == ConnectivityState::Shutdown {
            return;
        }
        let status = Status::unavailable("channel closed");
        self.core.calls.fail_all(&status);
        self.core.closed.cancel();
        // Calls registered while the first sweep ran.
        self.core.calls.fail_all(&status);
        self.core.transport.lock().await.take();
        #[cfg(feature = "tracing")]
        tracing::debug!(authority = %self.core.authority, "channel closed");
    }

    fn prepare<Req: RpcMessage>(
        &self,
        method: &str,
        request: &Req,
        options: CallOptions,
    ) -> Result<Prepared, ClientError> {
        let method = MethodPath::parse(method).map_err(|e| ClientError::invalid_argument(e.to_string()))?;
        if self.is_closed() {
            return Err(ClientError::unavailable("channel closed"));
        }
        let now = Instant::now();
        let deadline = options.resolve_deadline(now);
        if deadline.is_some_and(|d| d <= now) {
            return Err(ClientError::deadline_exceeded("deadline exceeded before the call started"));
        }

        let codec = self.core.options.get_codec();
        let body = codec.encode(request).map_err(ClientError::encode)?;
        self.core
            .options
            .limits()
            .check_send(body.len())
            .map_err(ClientError::resource_exhausted)?;

        let (mut metadata, cancellation) = options.into_parts();
        let context = AuthContext {
            service_url: format!("{}/{}", self.target(), method.service()),
            method_name: method.method().to_owned(),
        };
        for credentials in self.core.credentials.call_credentials() {
            credentials.apply(&context, &mut metadata)?;
        }

        let registration = self.core.calls.register(&self.core.closed);
        if self.is_closed() {
            return Err(ClientError::unavailable("channel closed"));
        }
        Ok(Prepared {
            registration,
            call: ClientCall {
                details: CallDetails::new(method, metadata, deadline, codec),
                body,
            },
            cancellation,
        })
    }

    /// Start a unary call. It runs while the returned handle is polled.
    pub fn start_unary<Req, Res>(&self, method: &str, request: &Req, options: CallOptions) -> UnaryCall<Res>
    where
        Req: RpcMessage,
        Res: RpcMessage,
    {
        let Prepared {
            registration,
            call,
            cancellation,
        } = match self.prepare(method, request, options) {
            Ok(prepared) => prepared,
            Err(e) => return UnaryCall::failed(e),
        };
        let record = registration.record().clone();
        let unary = self.unary.clone();
        let limits = self.core.options.limits();
        let codec = call.details.codec();

        let future = async move {
            let work = async move {
                let response = unary(call).await?;
                limits
                    .check_receive(response.body.len())
                    .map_err(ClientError::resource_exhausted)?;
                let message = codec.decode::<Res>(&response.body).map_err(ClientError::decode)?;
                Ok(Response::with_metadata(message, response.metadata, response.trailers))
            };
            registration.record().run(cancellation, work).await
        };
        UnaryCall::new(record, Box::pin(future))
    }

    pub async fn unary_call<Req, Res>(
        &self,
        method: &str,
        request: &Req,
        options: CallOptions,
    ) -> Result<Response<Res>, ClientError>
    where
        Req: RpcMessage,
        Res: RpcMessage,
    {
        self.start_unary(method, request, options).await
    }

    /// Start a server-streaming call and wait for the response headers.
    pub async fn streaming_call<Req, Res>(
        &self,
        method: &str,
        request: &Req,
        options: CallOptions,
    ) -> Result<ResponseStream<Res>, ClientError>
    where
        Req: RpcMessage,
        Res: RpcMessage,
    {
        let Prepared {
            registration,
            call,
            cancellation,
        } = self.prepare(method, request, options)?;
        let codec = call.details.codec();
        let response = registration
            .record()
            .start(cancellation.clone(), (self.streaming)(call))
            .await?;
        Ok(ResponseStream::new(
            registration,
            response.metadata,
            response.frames,
            codec,
            cancellation,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::CallState;
    use std::time::Duration;
    use wirecall_core::Code;

    #[derive(Clone, PartialEq, prost::Message, serde::Serialize, serde::Deserialize)]
    struct Ping {
        #[prost(string, tag = "1")]
        text: String,
    }

    fn ping() -> Ping {
        Ping { text: "hi".into() }
    }

    #[test]
    fn test_parse_target_forms() {
        let insecure = ChannelCredentials::insecure();
        let (scheme, authority) = parse_target("localhost:50051", &insecure).unwrap();
        assert_eq!((scheme, authority.as_str()), ("http", "localhost:50051"));
        let (_, authority) = parse_target("http://example.com/", &insecure).unwrap();
        assert_eq!(authority.as_str(), "example.com");

        assert!(parse_target("https://example.com:443", &insecure).is_err());
        assert!(parse_target("example.com", &insecure).is_err());
        assert!(parse_target("http://example.com/api", &insecure).is_err());
        assert!(parse_target("", &insecure).is_err());
    }

    #[test]
    fn test_tls_credentials_reject_http_target() {
        let tls = ChannelCredentials::tls(crate::TlsCredentials::new());
        let err = Channel::open("http://example.com", tls, ChannelOptions::default()).unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[test]
    fn test_split_unary_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", HeaderValue::from_static("abc"));
        headers.insert("trailer-x-cost", HeaderValue::from_static("7"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/proto"));
        let (leading, trailing) = split_unary_headers(&headers);
        assert_eq!(leading.get_str("x-request-id"), Some("abc"));
        assert!(leading.get("trailer-x-cost").is_none());
        assert!(leading.get("content-type").is_none());
        assert_eq!(trailing.get_str("x-cost"), Some("7"));
    }

    #[test]
    fn test_expect_content_type() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json; charset=utf-8"));
        assert!(expect_content_type(&headers, Codec::Json, Framing::Unary).is_ok());
        assert!(expect_content_type(&headers, Codec::Proto, Framing::Unary).is_err());
        assert!(expect_content_type(&HeaderMap::new(), Codec::Json, Framing::Unary).is_err());
    }

    #[tokio::test]
    async fn test_expired_deadline_never_touches_transport() {
        let channel = Channel::insecure("127.0.0.1:9").unwrap();
        let options = CallOptions::new().deadline(Instant::now() - Duration::from_secs(1));
        let call = channel.start_unary::<_, Ping>("/test.Pinger/Ping", &ping(), options);
        assert_eq!(call.state(), CallState::Failed);
        let err = call.await.unwrap_err();
        assert_eq!(err.code(), Code::DeadlineExceeded);
        assert_eq!(channel.state(), ConnectivityState::Idle);
        assert_eq!(channel.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_invalid_method_path() {
        let channel = Channel::insecure("127.0.0.1:9").unwrap();
        let err = channel
            .unary_call::<_, Ping>("Ping", &ping(), CallOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_send_limit_is_resource_exhausted() {
        let options = ChannelOptions::new().max_send_message_length(1);
        let channel = Channel::open("127.0.0.1:9", ChannelCredentials::insecure(), options).unwrap();
        let err = channel
            .unary_call::<_, Ping>("/test.Pinger/Ping", &ping(), CallOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::ResourceExhausted);
        assert_eq!(channel.state(), ConnectivityState::Idle);
    }

    #[tokio::test]
    async fn test_connect_and_close() {
        let channel = Channel::insecure("127.0.0.1:9").unwrap();
        let mut states = channel.watch_state();
        channel.connect().await.unwrap();
        assert_eq!(channel.state(), ConnectivityState::Ready);
        assert!(states.has_changed().unwrap());

        channel.close().await;
        channel.close().await;
        assert_eq!(channel.state(), ConnectivityState::Shutdown);
        assert!(channel.connect().await.is_err());
        let err = channel
            .unary_call::<_, Ping>("/test.Pinger/Ping", &ping(), CallOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);
    }

    #[tokio::test]
    async fn test_refused_connection_is_transient_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let channel = Channel::insecure(&addr.to_string()).unwrap();
        let err = channel
            .unary_call::<_, Ping>("/test.Pinger/Ping", &ping(), CallOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);
        assert_eq!(channel.state(), ConnectivityState::TransientFailure);
    }

    #[tokio::test]
    async fn test_interceptor_answer_skips_transport() {
        let channel = Channel::insecure("127.0.0.1:9").unwrap().intercept(crate::FnInterceptor::unary(
            |_call, _next: crate::UnaryNext| {
                Box::pin(async {
                    Ok(UnaryResponse {
                        body: Codec::Proto.encode(&Ping { text: "local".into() }).unwrap_or_default(),
                        ..Default::default()
                    })
                })
            },
        ));
        let reply = channel
            .unary_call::<_, Ping>("/test.Pinger/Ping", &ping(), CallOptions::new())
            .await
            .unwrap();
        assert_eq!(reply.get_ref().text, "local");
        assert_eq!(channel.state(), ConnectivityState::Idle);
    }
}

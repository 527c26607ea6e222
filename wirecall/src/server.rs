//! Server construction and lifecycle.
//!
//! ```text
//! Created --start()--> Serving --graceful_stop()/stop()--> Stopping --> Stopped
//! ```

use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::Request;
use axum::routing::post;
use futures::Stream;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use wirecall_core::{MessageLimits, MethodPath, RpcMessage, Status};

use crate::dispatch::{self, MethodEntry, Shared};
use crate::error::ServerError;
use crate::handler::{self, MethodKind};
use crate::interceptor::{Dispatch, ServerInterceptor, compose};
use crate::pool::WorkerPool;
use crate::request::{Request as RpcRequest, Response};

/// Extra time given to cancelled handlers and to the accept loop before
/// they are aborted outright.
const FORCE_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Serving,
    Stopping,
    Stopped,
}

fn default_max_workers() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get()) * 5
}

/// Builder for a [`Server`].
pub struct ServerBuilder {
    methods: Vec<(String, MethodKind, Dispatch)>,
    interceptors: Vec<Arc<dyn ServerInterceptor>>,
    max_workers: usize,
    max_queued: Option<usize>,
    max_timeout: Option<Duration>,
    limits: MessageLimits,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self {
            methods: Vec::new(),
            interceptors: Vec::new(),
            max_workers: default_max_workers(),
            max_queued: None,
            max_timeout: None,
            limits: MessageLimits::default(),
        }
    }
}

impl ServerBuilder {
    /// Register a unary method.
    ///
    /// ```rust,ignore
    /// Server::builder().unary("/Greeter/SayHello", |req: Request<HelloRequest>| async move {
    ///     Ok(Response::new(HelloReply { message: format!("Hello, {}!", req.message().name) }))
    /// });
    /// ```
    pub fn unary<Req, Res, F, Fut>(mut self, method: &str, handler: F) -> Self
    where
        Req: RpcMessage,
        Res: RpcMessage,
        F: Fn(RpcRequest<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response<Res>, Status>> + Send + 'static,
    {
        self.methods
            .push((method.to_owned(), MethodKind::Unary, handler::unary(handler)));
        self
    }

    /// Register a server-streaming method. Messages of the returned stream
    /// reach the client in order; an `Err` item ends the stream with that
    /// status.
    pub fn server_streaming<Req, Res, S, F, Fut>(mut self, method: &str, handler: F) -> Self
    where
        Req: RpcMessage,
        Res: RpcMessage,
        S: Stream<Item = Result<Res, Status>> + Send + 'static,
        F: Fn(RpcRequest<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response<S>, Status>> + Send + 'static,
    {
        self.methods.push((
            method.to_owned(),
            MethodKind::ServerStreaming,
            handler::server_streaming(handler),
        ));
        self
    }

    /// Add an interceptor. The first one added runs outermost.
    pub fn interceptor<I: ServerInterceptor>(mut self, interceptor: I) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Handlers allowed to run at once.
    pub fn max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers;
        self
    }

    /// Calls allowed to wait for a worker; beyond this, calls fail with
    /// `RESOURCE_EXHAUSTED`. Unbounded by default.
    pub fn max_queued(mut self, queued: usize) -> Self {
        self.max_queued = Some(queued);
        self
    }

    /// Upper bound on any call's deadline.
    pub fn max_timeout(mut self, timeout: Duration) -> Self {
        self.max_timeout = Some(timeout);
        self
    }

    pub fn message_limits(mut self, limits: MessageLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn build(self) -> Result<Server, ServerError> {
        if self.max_workers == 0 {
            return Err(ServerError::InvalidConfig("max_workers must be at least 1".into()));
        }
        let mut seen = HashSet::new();
        let mut methods = Vec::with_capacity(self.methods.len());
        for (path, kind, dispatch) in self.methods {
            let path = MethodPath::parse(&path)?;
            if !seen.insert(path.clone()) {
                return Err(ServerError::DuplicateMethod(path.to_string()));
            }
            methods.push(Arc::new(MethodEntry {
                path,
                kind,
                dispatch: compose(&self.interceptors, dispatch),
            }));
        }
        Ok(Server {
            methods,
            max_workers: self.max_workers,
            max_queued: self.max_queued,
            max_timeout: self.max_timeout,
            limits: self.limits,
        })
    }
}

/// A configured server that has not started yet.
pub struct Server {
    methods: Vec<Arc<MethodEntry>>,
    max_workers: usize,
    max_queued: Option<usize>,
    max_timeout: Option<Duration>,
    limits: MessageLimits,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    pub fn state(&self) -> ServerState {
        ServerState::Created
    }

    pub fn methods(&self) -> impl Iterator<Item = &MethodPath> {
        self.methods.iter().map(|entry| &entry.path)
    }

    /// Bind `addr` and start serving.
    pub async fn start<A: ToSocketAddrs>(self, addr: A) -> Result<ServerHandle, ServerError> {
        let listener = TcpListener::bind(addr).await?;
        self.start_with_listener(listener)
    }

    /// Start serving on an already bound listener. Must be called from within
    /// a tokio runtime.
    pub fn start_with_listener(self, listener: TcpListener) -> Result<ServerHandle, ServerError> {
        let local_addr = listener.local_addr()?;
        let (router, shared) = self.into_router();
        let shutdown = CancellationToken::new();
        let app = router.into_make_service_with_connect_info::<SocketAddr>();
        let serve = tokio::spawn(
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.clone().cancelled_owned())
                .into_future(),
        );
        tracing::debug!(%local_addr, "server started");

        Ok(ServerHandle {
            inner: Arc::new(HandleInner {
                shared,
                local_addr,
                shutdown,
                serve: Mutex::new(Some(serve)),
            }),
        })
    }

    pub(crate) fn into_router(self) -> (Router, Arc<Shared>) {
        let shared = Arc::new(Shared {
            state: watch::channel(ServerState::Serving).0,
            pool: WorkerPool::new(self.max_workers, self.max_queued),
            calls: CancellationToken::new(),
            tracker: TaskTracker::new(),
            max_timeout: self.max_timeout,
            limits: self.limits,
        });

        let mut router = Router::new();
        for entry in self.methods {
            let path = entry.path.as_str().to_owned();
            let state = shared.clone();
            router = router.route(
                &path,
                post(move |request: Request| dispatch::handle(state.clone(), entry.clone(), request)),
            );
        }
        let state = shared.clone();
        let router = router.fallback(move |request: Request| dispatch::unimplemented(state.clone(), request));
        (router, shared)
    }
}

struct HandleInner {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    /// Taken by the first stop; later stops wait for `Stopped`.
    serve: Mutex<Option<JoinHandle<std::io::Result<()>>>>,
}

/// Control handle of a running server. Cloning shares the same server.
#[derive(Clone)]
pub struct ServerHandle {
    inner: Arc<HandleInner>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn state(&self) -> ServerState {
        *self.inner.shared.state.borrow()
    }

    /// Handlers currently running on a worker.
    pub fn in_flight(&self) -> usize {
        self.inner.shared.pool.in_flight()
    }

    /// Calls waiting for a worker.
    pub fn queued(&self) -> usize {
        self.inner.shared.pool.queued()
    }

    /// Stop accepting calls, give in-flight calls up to `timeout` to finish,
    /// then cancel whatever is left.
    ///
    /// Returns once the server is `Stopped`: after at most `timeout` plus a
    /// short grace window for cancelled handlers.
    pub async fn graceful_stop(&self, timeout: Duration) {
        let mut serve_slot = self.inner.serve.lock().await;
        let Some(mut serve) = serve_slot.take() else {
            drop(serve_slot);
            self.wait().await;
            return;
        };
        let shared = &self.inner.shared;
        shared.state.send_replace(ServerState::Stopping);
        self.inner.shutdown.cancel();
        shared.tracker.close();

        if tokio::time::timeout(timeout, shared.tracker.wait()).await.is_err() {
            tracing::debug!(remaining = shared.tracker.len(), "grace period over, cancelling calls");
            shared.calls.cancel();
            if tokio::time::timeout(FORCE_GRACE, shared.tracker.wait()).await.is_err() {
                tracing::warn!(
                    remaining = shared.tracker.len(),
                    "handlers did not observe cancellation"
                );
            }
        }
        shared.calls.cancel();
        shared.pool.close();

        match tokio::time::timeout(FORCE_GRACE, &mut serve).await {
            Ok(Ok(Err(e))) => tracing::warn!(error = %e, "server exited with an error"),
            Ok(_) => {}
            Err(_) => serve.abort(),
        }
        shared.state.send_replace(ServerState::Stopped);
        tracing::debug!(local_addr = %self.inner.local_addr, "server stopped");
    }

    /// Stop immediately, cancelling in-flight calls.
    pub async fn stop(&self) {
        self.graceful_stop(Duration::ZERO).await;
    }

    /// Resolve once the server has stopped.
    pub async fn wait(&self) {
        let mut state = self.inner.shared.state.subscribe();
        let _ = state.wait_for(|s| *s == ServerState::Stopped).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http::StatusCode;
    use http::header::CONTENT_TYPE;
    use http_body_util::BodyExt;
    use serde::{Deserialize, Serialize};
    use tower::ServiceExt;
    use wirecall_core::{Code, Codec};

    #[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
    struct Echo {
        #[prost(string, tag = "1")]
        #[serde(default)]
        text: String,
    }

    fn echo_server() -> Server {
        Server::builder()
            .unary("/test.Echo/Say", |req: RpcRequest<Echo>| async move {
                Ok(Response::new(req.into_message()))
            })
            .unary("/test.Echo/Fail", |_req: RpcRequest<Echo>| async move {
                Err::<Response<Echo>, _>(Status::not_found("nothing here"))
            })
            .build()
            .unwrap()
    }

    fn json_request(path: &str, body: &'static str) -> Request {
        http::Request::post(path)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_unary_json_round_trip() {
        let (router, _) = echo_server().into_router();
        let response = router
            .oneshot(json_request("/test.Echo/Say", r#"{"text":"hi"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let echo: Echo = Codec::Json.decode(&body).unwrap();
        assert_eq!(echo.text, "hi");
    }

    #[tokio::test]
    async fn test_handler_status_is_returned() {
        let (router, _) = echo_server().into_router();
        let response = router
            .oneshot(json_request("/test.Echo/Fail", "{}"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let status = Status::from_json(&body).unwrap();
        assert_eq!(status.code(), Code::NotFound);
        assert_eq!(status.message(), Some("nothing here"));
    }

    #[tokio::test]
    async fn test_unknown_method_is_unimplemented() {
        let (router, _) = echo_server().into_router();
        let response = router
            .oneshot(json_request("/test.Echo/Missing", "{}"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(Status::from_json(&body).unwrap().code(), Code::Unimplemented);
    }

    #[tokio::test]
    async fn test_malformed_request_is_invalid_argument() {
        let (router, _) = echo_server().into_router();
        let response = router
            .oneshot(json_request("/test.Echo/Say", "{broken"))
            .await
            .unwrap();

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(Status::from_json(&body).unwrap().code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_unknown() {
        let server = Server::builder()
            .unary("/test.Echo/Boom", |_req: RpcRequest<Echo>| async move {
                if true {
                    panic!("boom");
                }
                Ok(Response::new(Echo::default()))
            })
            .build()
            .unwrap();
        let (router, _) = server.into_router();

        let response = router
            .clone()
            .oneshot(json_request("/test.Echo/Boom", "{}"))
            .await
            .unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(Status::from_json(&body).unwrap().code(), Code::Unknown);

        // The server keeps serving after a handler panic.
        let response = router
            .oneshot(json_request("/test.Echo/Boom", "{}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_server_deadline_cancels_slow_handler() {
        let server = Server::builder()
            .max_timeout(Duration::from_millis(50))
            .unary("/test.Echo/Slow", |req: RpcRequest<Echo>| async move {
                req.context().cancellation().cancelled().await;
                Ok(Response::new(Echo::default()))
            })
            .build()
            .unwrap();
        let (router, _) = server.into_router();

        let response = router
            .oneshot(json_request("/test.Echo/Slow", "{}"))
            .await
            .unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(Status::from_json(&body).unwrap().code(), Code::DeadlineExceeded);
    }

    #[tokio::test]
    async fn test_calls_rejected_when_not_serving() {
        let (router, shared) = echo_server().into_router();
        shared.state.send_replace(ServerState::Stopping);

        let response = router
            .oneshot(json_request("/test.Echo/Say", "{}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_build_rejects_bad_configuration() {
        let handler = |req: RpcRequest<Echo>| async move { Ok(Response::new(req.into_message())) };

        let err = Server::builder().unary("no-slash", handler).build().err().unwrap();
        assert!(matches!(err, ServerError::InvalidMethod(_)));

        let err = Server::builder()
            .unary("/a.B/C", handler)
            .unary("/a.B/C", handler)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, ServerError::DuplicateMethod(_)));

        let err = Server::builder().max_workers(0).build().err().unwrap();
        assert!(matches!(err, ServerError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_stop_without_calls_is_prompt() {
        let handle = echo_server()
            .start("127.0.0.1:0")
            .await
            .unwrap();
        assert_eq!(handle.state(), ServerState::Serving);

        tokio::time::timeout(Duration::from_secs(2), handle.stop())
            .await
            .unwrap();
        assert_eq!(handle.state(), ServerState::Stopped);

        // A second stop returns at once.
        handle.graceful_stop(Duration::from_secs(10)).await;
    }
}

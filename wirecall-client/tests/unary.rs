//! Unary calls against a live server.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::*;
use wirecall::prelude::{RequireMetadata, Status as ServerStatus};
use wirecall_client::{
    BoxFuture, CallOptions, CallState, CancellationToken, Channel, ChannelOptions, ChannelCredentials, ClientCall,
    ClientError, Code, Codec, ConnectivityState, DefaultTimeout, FnInterceptor, Interceptor, InterceptorChain,
    MetadataInterceptor, RetryPolicy, UnaryNext, UnaryResponse, retry_with_policy,
};

#[tokio::test]
async fn test_say_hello() {
    let server = start(services()).await;
    let channel = channel_to(&server);
    assert_eq!(channel.state(), ConnectivityState::Idle);

    let response = channel
        .unary_call::<_, HelloReply>(SAY_HELLO, &hello("you"), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(response.get_ref().message, "Hello, you!");
    assert_eq!(response.metadata().get_str("x-greeter"), Some("wirecall"));
    assert_eq!(response.trailers().get_str("x-cost"), Some("1"));
    assert_eq!(channel.state(), ConnectivityState::Ready);
    assert_eq!(channel.in_flight(), 0);

    server.stop().await;
}

#[tokio::test]
async fn test_unary_call_handle_reports_ok() {
    let server = start(services()).await;
    let channel = channel_to(&server);

    let mut call = channel.start_unary::<_, HelloReply>(SAY_HELLO, &hello("handle"), CallOptions::new());
    assert_eq!(call.state(), CallState::Pending);
    let response = (&mut call).await.unwrap();
    assert_eq!(response.into_inner().message, "Hello, handle!");
    assert_eq!(call.state(), CallState::Completed);
    assert!(call.status().unwrap().is_ok());

    server.stop().await;
}

#[tokio::test]
async fn test_json_codec() {
    let server = start(services()).await;
    let channel = Channel::open(
        &server.local_addr().to_string(),
        ChannelCredentials::insecure(),
        ChannelOptions::default().codec(Codec::Json),
    )
    .unwrap();

    let response = channel
        .unary_call::<_, HelloReply>(SAY_HELLO, &hello("json"), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(response.into_inner().message, "Hello, json!");

    server.stop().await;
}

#[tokio::test]
async fn test_handler_error() {
    let server = start(services()).await;
    let channel = channel_to(&server);

    let mut call = channel.start_unary::<_, HelloReply>(SAY_HELLO, &hello(""), CallOptions::new());
    let err = (&mut call).await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert_eq!(err.message(), Some("name is required"));
    assert_eq!(call.state(), CallState::Failed);
    // The server answered, so the connection itself is fine.
    assert_eq!(channel.state(), ConnectivityState::Ready);

    server.stop().await;
}

#[tokio::test]
async fn test_unknown_method() {
    let server = start(services()).await;
    let channel = channel_to(&server);

    let err = channel
        .unary_call::<_, HelloReply>("/greet.Greeter/Missing", &hello("x"), CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);

    server.stop().await;
}

#[tokio::test]
async fn test_expired_deadline_never_connects() {
    let server = start(services()).await;
    let channel = channel_to(&server);

    let options = CallOptions::new().deadline(tokio::time::Instant::now() - Duration::from_millis(1));
    let err = channel
        .unary_call::<_, HelloReply>(SAY_HELLO, &hello("late"), options)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::DeadlineExceeded);
    assert_eq!(channel.state(), ConnectivityState::Idle);

    server.stop().await;
}

#[tokio::test]
async fn test_deadline_exceeded() {
    let server = start(services()).await;
    let channel = channel_to(&server);

    let mut call = channel.start_unary::<_, HelloReply>(
        SLOW,
        &slow(Duration::from_secs(5)),
        CallOptions::new().timeout(Duration::from_millis(100)),
    );
    let err = (&mut call).await.unwrap_err();
    assert_eq!(err.code(), Code::DeadlineExceeded);
    assert_eq!(call.state(), CallState::Failed);
    assert_eq!(channel.in_flight(), 0);

    server.stop().await;
}

#[tokio::test]
async fn test_default_timeout_interceptor() {
    let server = start(services()).await;
    let channel = channel_to(&server).intercept(DefaultTimeout(Duration::from_millis(100)));

    let err = channel
        .unary_call::<_, HelloReply>(SLOW, &slow(Duration::from_secs(5)), CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::DeadlineExceeded);

    // An explicit timeout is kept.
    let response = channel
        .unary_call::<_, HelloReply>(
            SLOW,
            &slow(Duration::from_millis(200)),
            CallOptions::new().timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap();
    assert_eq!(response.into_inner().message, "done");

    server.stop().await;
}

#[tokio::test]
async fn test_cancel_unary_call() {
    let server = start(services()).await;
    let channel = channel_to(&server);

    let mut call = channel.start_unary::<_, HelloReply>(SLOW, &slow(Duration::from_secs(5)), CallOptions::new());
    assert!(tokio::time::timeout(Duration::from_millis(50), &mut call).await.is_err());
    assert_eq!(call.state(), CallState::Active);

    call.cancel();
    let err = call.await.unwrap_err();
    assert_eq!(err.code(), Code::Canceled);
    assert_eq!(channel.in_flight(), 0);

    server.stop().await;
}

#[tokio::test]
async fn test_cancellation_token() {
    let server = start(services()).await;
    let channel = channel_to(&server);

    let token = CancellationToken::new();
    let mut call = channel.start_unary::<_, HelloReply>(
        SLOW,
        &slow(Duration::from_secs(5)),
        CallOptions::new().cancellation(token.clone()),
    );
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    });
    let err = (&mut call).await.unwrap_err();
    assert_eq!(err.code(), Code::Canceled);
    assert_eq!(call.state(), CallState::Cancelled);

    server.stop().await;
}

struct Counting(Arc<AtomicUsize>);

impl Interceptor for Counting {
    fn wrap_unary(&self, next: wirecall_client::UnaryFunc) -> wirecall_client::UnaryFunc {
        let seen = self.0.clone();
        Arc::new(move |call: ClientCall| {
            seen.fetch_add(1, Ordering::SeqCst);
            next(call)
        })
    }
}

#[tokio::test]
async fn test_pass_through_interceptors_change_nothing() {
    let server = start(services()).await;
    let plain = channel_to(&server);

    let seen = Arc::new(AtomicUsize::new(0));
    let chain = InterceptorChain::new()
        .with(Counting(seen.clone()))
        .with(Counting(seen.clone()));
    let wrapped = plain.with_interceptors(chain);

    let a = plain
        .unary_call::<_, HelloReply>(SAY_HELLO, &hello("same"), CallOptions::new())
        .await
        .unwrap();
    let b = wrapped
        .unary_call::<_, HelloReply>(SAY_HELLO, &hello("same"), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(a.get_ref(), b.get_ref());
    assert_eq!(a.trailers().get_str("x-cost"), b.trailers().get_str("x-cost"));
    assert_eq!(seen.load(Ordering::SeqCst), 2);

    let a = plain
        .unary_call::<_, HelloReply>(SAY_HELLO, &hello(""), CallOptions::new())
        .await
        .unwrap_err();
    let b = wrapped
        .unary_call::<_, HelloReply>(SAY_HELLO, &hello(""), CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(a.code(), b.code());
    assert_eq!(a.message(), b.message());

    server.stop().await;
}

#[tokio::test]
async fn test_short_circuit_interceptor() {
    let server = start(services()).await;
    let channel = channel_to(&server).intercept(FnInterceptor::unary(
        |call: ClientCall, next: UnaryNext| -> BoxFuture<'static, Result<UnaryResponse, ClientError>> {
            Box::pin(async move {
                if call.details.method().method() == "SayHello" {
                    return Err(ClientError::permission_denied("blocked locally"));
                }
                next.call(call).await
            })
        },
    ));

    let err = channel
        .unary_call::<_, HelloReply>(SAY_HELLO, &hello("x"), CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::PermissionDenied);
    // Never reached the transport.
    assert_eq!(channel.state(), ConnectivityState::Idle);

    let response = channel
        .unary_call::<_, HelloReply>(WHO_AM_I, &hello("x"), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(response.into_inner().message, "anonymous");

    server.stop().await;
}

#[tokio::test]
async fn test_required_metadata() {
    let server = start(services().interceptor(RequireMetadata::new("authorization"))).await;
    let channel = channel_to(&server);

    let err = channel
        .unary_call::<_, HelloReply>(WHO_AM_I, &hello("x"), CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);

    let response = channel
        .unary_call::<_, HelloReply>(
            WHO_AM_I,
            &hello("x"),
            CallOptions::new().with_metadata("authorization", "Bearer abc").unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.into_inner().message, "Bearer abc");

    // Same thing through a metadata interceptor.
    let authed = channel.intercept(MetadataInterceptor::new("authorization", "Bearer xyz").unwrap());
    let response = authed
        .unary_call::<_, HelloReply>(WHO_AM_I, &hello("x"), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(response.into_inner().message, "Bearer xyz");

    server.stop().await;
}

#[tokio::test]
async fn test_required_metadata_custom_rejection() {
    let guard = RequireMetadata::new("x-tenant").reject_with(ServerStatus::permission_denied("tenant required"));
    let server = start(services().interceptor(guard)).await;
    let channel = channel_to(&server);

    let err = channel
        .unary_call::<_, HelloReply>(SAY_HELLO, &hello("x"), CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::PermissionDenied);
    assert_eq!(err.message(), Some("tenant required"));

    server.stop().await;
}

#[tokio::test]
async fn test_receive_limit() {
    let server = start(services()).await;
    let channel = Channel::open(
        &server.local_addr().to_string(),
        ChannelCredentials::insecure(),
        ChannelOptions::default().max_receive_message_length(4),
    )
    .unwrap();

    let err = channel
        .unary_call::<_, HelloReply>(SAY_HELLO, &hello("a rather long name"), CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::ResourceExhausted);

    server.stop().await;
}

#[tokio::test]
async fn test_retry_recovers_from_unavailable() {
    let server = start(services()).await;
    let channel = channel_to(&server);

    let policy = RetryPolicy::new()
        .base_delay(Duration::from_millis(10))
        .max_delay(Duration::from_millis(50))
        .max_retries(3);
    let attempts = AtomicUsize::new(0);
    let req = hello("x");
    let response = retry_with_policy(&policy, || {
        attempts.fetch_add(1, Ordering::SeqCst);
        channel.unary_call::<_, HelloReply>(FLAKY, &req, CallOptions::new())
    })
    .await
    .unwrap();
    assert_eq!(response.into_inner().message, "attempt 2");
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    server.stop().await;
}

#[tokio::test]
async fn test_single_segment_service_name() {
    let builder = wirecall::prelude::Server::builder().unary(
        "/Greeter/SayHello",
        |req: wirecall::prelude::Request<HelloRequest>| async move {
            Ok(wirecall::prelude::Response::new(HelloReply {
                message: format!("Hello, {}!", req.message().name),
            }))
        },
    );
    let server = start(builder).await;
    let channel = channel_to(&server);

    let mut call = channel.start_unary::<_, HelloReply>("/Greeter/SayHello", &hello("you"), CallOptions::new());
    let response = (&mut call).await.unwrap();
    assert_eq!(response.into_inner().message, "Hello, you!");
    assert_eq!(call.status().unwrap().code(), Code::Ok);

    server.stop().await;
}

#[tokio::test]
async fn test_metadata_keeps_per_key_order() {
    let server = start(services()).await;
    let channel = channel_to(&server);

    let options = CallOptions::new()
        .with_metadata("x-z", "1")
        .and_then(|o| o.with_metadata("x-a", "2"))
        .and_then(|o| o.with_metadata("x-z", "3"))
        .unwrap();
    let response = channel
        .unary_call::<_, HelloReply>(ECHO_METADATA, &hello("order"), options)
        .await
        .unwrap();

    let expected = [("x-z", "1"), ("x-z", "3"), ("x-a", "2")].map(|(k, v)| (k.to_owned(), v.to_owned()));
    assert_eq!(custom(response.metadata()), expected);
    // Repeated trailer keys survive the `trailer-` prefix.
    assert_eq!(custom(response.trailers()), expected);

    server.stop().await;
}

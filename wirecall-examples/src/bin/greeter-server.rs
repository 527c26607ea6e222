//! Greeter server
//!
//! - SayHello (unary): POST /hello.Greeter/SayHello
//! - SayHelloStream (server streaming): POST /hello.Greeter/SayHelloStream
//!
//! Every call must carry `authorization: Bearer demo`. Ctrl-C stops the
//! server, giving in-flight calls five seconds to finish.
//!
//! Run with: cargo run --bin greeter-server
//! Then: cargo run --bin greeter-client

use std::time::Duration;

use futures::Stream;
use wirecall::prelude::*;
use wirecall_examples::{DEMO_TOKEN, HelloReply, HelloRequest, SAY_HELLO, SAY_HELLO_STREAM};

async fn say_hello(req: Request<HelloRequest>) -> Result<Response<HelloReply>, Status> {
    let name = &req.message().name;
    if name.is_empty() {
        return Err(Status::invalid_argument("name must not be empty"));
    }
    let mut trailers = Metadata::new();
    trailers
        .append("x-greeted", name.as_str())
        .map_err(|e| Status::internal(e.to_string()))?;
    Ok(Response::new(HelloReply {
        message: format!("Hello, {name}!"),
    })
    .with_trailers(trailers))
}

async fn say_hello_stream(
    req: Request<HelloRequest>,
) -> Result<Response<impl Stream<Item = Result<HelloReply, Status>>>, Status> {
    let (req, context) = req.into_parts();
    let delay = Duration::from_millis(req.delay_ms.into());
    let name = if req.name.is_empty() { "World".to_owned() } else { req.name };

    let replies = async_stream::stream! {
        yield Ok(HelloReply { message: format!("Hello, {name}! Starting stream...") });
        for (idx, hobby) in req.hobbies.iter().enumerate() {
            let cancelled = tokio::select! {
                _ = tokio::time::sleep(delay) => false,
                _ = context.cancellation().cancelled() => true,
            };
            if cancelled {
                break;
            }
            yield Ok(HelloReply { message: format!("Hobby #{}: {hobby} - nice!", idx + 1) });
        }
        yield Ok(HelloReply { message: format!("Stream complete. Goodbye, {name}!") });
    };
    Ok(Response::new(replies))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    wirecall_examples::init_tracing();

    let server = Server::builder()
        .interceptor(TraceInterceptor::new())
        .interceptor(RequireMetadata::new("authorization").with_value(DEMO_TOKEN))
        .unary(SAY_HELLO, say_hello)
        .server_streaming(SAY_HELLO_STREAM, say_hello_stream)
        .max_timeout(Duration::from_secs(30))
        .build()?;

    let handle = server.start(wirecall_examples::server_addr()).await?;
    tracing::info!(addr = %handle.local_addr(), "greeter listening");

    tokio::signal::ctrl_c().await?;
    tracing::info!(in_flight = handle.in_flight(), "shutting down");
    handle.graceful_stop(Duration::from_secs(5)).await;
    Ok(())
}

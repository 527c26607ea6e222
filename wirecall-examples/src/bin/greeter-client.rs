//! Greeter client
//!
//! Exercises the greeter server: a unary call, a stream read to the end, a
//! stream cancelled halfway, a deadline and a rejected call without
//! credentials.
//!
//! Usage:
//!   # First, start the server in another terminal:
//!   cargo run --bin greeter-server
//!
//!   # Then run the client (defaults to 127.0.0.1:3000):
//!   cargo run --bin greeter-client
//!
//!   # Or specify a custom target:
//!   cargo run --bin greeter-client -- http://127.0.0.1:8080

use std::env;
use std::time::Duration;

use futures::StreamExt;
use wirecall_client::{CallOptions, Channel, Code, MetadataInterceptor, RetryPolicy, retry_with_policy};
use wirecall_examples::{DEMO_TOKEN, HelloReply, HelloRequest, SAY_HELLO, SAY_HELLO_STREAM};

fn request(name: &str, hobbies: &[&str], delay_ms: u32) -> HelloRequest {
    HelloRequest {
        name: name.to_owned(),
        hobbies: hobbies.iter().map(|h| (*h).to_owned()).collect(),
        delay_ms,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    wirecall_examples::init_tracing();

    let target = env::args()
        .nth(1)
        .unwrap_or_else(|| wirecall_examples::server_addr().to_string());
    let anonymous = Channel::insecure(&target)?;
    let channel = anonymous.intercept(MetadataInterceptor::new("authorization", DEMO_TOKEN)?);

    println!("=== Greeter client against {target} ===");

    println!("1. Unary call");
    let policy = RetryPolicy::new().max_retries(3);
    let alice = request("Alice", &[], 0);
    let response = retry_with_policy(&policy, || {
        channel.unary_call::<_, HelloReply>(SAY_HELLO, &alice, CallOptions::new())
    })
    .await?;
    println!("   {} (trailers: {:?})", response.get_ref().message, response.trailers());

    println!("2. Server stream");
    let mut stream = channel
        .streaming_call::<_, HelloReply>(
            SAY_HELLO_STREAM,
            &request("Bob", &["reading", "coding"], 100),
            CallOptions::new(),
        )
        .await?;
    while let Some(reply) = stream.next().await {
        println!("   {}", reply?.message);
    }
    println!("   ended with {:?}", stream.state());

    println!("3. Cancel a stream after two replies");
    let mut stream = channel
        .streaming_call::<_, HelloReply>(
            SAY_HELLO_STREAM,
            &request("Carol", &["a", "b", "c", "d", "e"], 200),
            CallOptions::new(),
        )
        .await?;
    for reply in stream.by_ref().take(2).collect::<Vec<_>>().await {
        println!("   {}", reply?.message);
    }
    stream.cancel();
    println!("   ended with {:?} / {:?}", stream.state(), stream.status().map(|s| s.code()));

    println!("4. Deadline shorter than the stream");
    let mut stream = channel
        .streaming_call::<_, HelloReply>(
            SAY_HELLO_STREAM,
            &request("Dave", &["x", "y", "z"], 500),
            CallOptions::new().timeout(Duration::from_millis(300)),
        )
        .await?;
    while let Some(reply) = stream.next().await {
        match reply {
            Ok(reply) => println!("   {}", reply.message),
            Err(e) if e.code() == Code::DeadlineExceeded => println!("   deadline exceeded, as expected"),
            Err(e) => return Err(e.into()),
        }
    }

    println!("5. No credentials");
    match anonymous
        .unary_call::<_, HelloReply>(SAY_HELLO, &request("Eve", &[], 0), CallOptions::new())
        .await
    {
        Err(e) if e.code() == Code::Unauthenticated => println!("   rejected: {e}"),
        other => anyhow::bail!("expected UNAUTHENTICATED, got {other:?}"),
    }

    channel.close().await;
    println!("Done.");
    Ok(())
}

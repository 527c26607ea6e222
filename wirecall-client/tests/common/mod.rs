#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures::Stream;
use serde::{Deserialize, Serialize};
use wirecall::prelude::*;
use wirecall_client::Channel;

pub const SAY_HELLO: &str = "/greet.Greeter/SayHello";
pub const WHO_AM_I: &str = "/greet.Greeter/WhoAmI";
pub const SLOW: &str = "/greet.Greeter/Slow";
pub const STUBBORN: &str = "/greet.Greeter/Stubborn";
pub const FLAKY: &str = "/greet.Greeter/Flaky";
pub const COUNT: &str = "/demo.Counter/Count";
pub const FAIL_AFTER: &str = "/demo.Counter/FailAfter";
pub const PANIC_AFTER: &str = "/demo.Counter/PanicAfter";
pub const ECHO_METADATA: &str = "/demo.Echo/Metadata";
pub const ECHO_METADATA_STREAM: &str = "/demo.Echo/MetadataStream";

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct HelloRequest {
    #[prost(string, tag = "1")]
    #[serde(default)]
    pub name: String,
    /// Used by the slow methods.
    #[prost(uint32, tag = "2")]
    #[serde(default)]
    pub delay_ms: u32,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct HelloReply {
    #[prost(string, tag = "1")]
    #[serde(default)]
    pub message: String,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct CountRequest {
    #[prost(uint32, tag = "1")]
    #[serde(default)]
    pub count: u32,
    #[prost(uint32, tag = "2")]
    #[serde(default)]
    pub delay_ms: u32,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct Tick {
    #[prost(uint32, tag = "1")]
    #[serde(default)]
    pub n: u32,
}

pub fn hello(name: &str) -> HelloRequest {
    HelloRequest {
        name: name.into(),
        delay_ms: 0,
    }
}

pub fn slow(delay: Duration) -> HelloRequest {
    HelloRequest {
        name: "slow".into(),
        delay_ms: u32::try_from(delay.as_millis()).unwrap_or(u32::MAX),
    }
}

pub fn count(count: u32, delay_ms: u32) -> CountRequest {
    CountRequest { count, delay_ms }
}

fn ticks(req: CountRequest) -> impl Stream<Item = Result<Tick, Status>> {
    async_stream::stream! {
        for n in 0..req.count {
            if n > 0 && req.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(req.delay_ms.into())).await;
            }
            yield Ok(Tick { n });
        }
    }
}

/// The `x-` pairs of `metadata`, in order.
pub fn custom(metadata: &Metadata) -> Vec<(String, String)> {
    metadata
        .iter()
        .filter(|(k, _)| k.starts_with("x-"))
        .filter_map(|(k, v)| Some((k.to_owned(), v.as_str()?.to_owned())))
        .collect()
}

fn echoed(metadata: &Metadata) -> Metadata {
    let mut out = Metadata::new();
    for (key, value) in metadata.iter().filter(|(k, _)| k.starts_with("x-")) {
        out.append(key, value.clone()).ok();
    }
    out
}

/// Greeter and counter methods shared by the end-to-end tests.
pub fn services() -> ServerBuilder {
    let flaky = Arc::new(AtomicU32::new(0));
    Server::builder()
        .unary(SAY_HELLO, |req: Request<HelloRequest>| async move {
            let name = &req.message().name;
            if name.is_empty() {
                return Err(Status::invalid_argument("name is required"));
            }
            let mut metadata = Metadata::new();
            metadata.append("x-greeter", "wirecall").ok();
            let mut trailers = Metadata::new();
            trailers.append("x-cost", "1").ok();
            Ok(Response::new(HelloReply {
                message: format!("Hello, {name}!"),
            })
            .with_metadata(metadata)
            .with_trailers(trailers))
        })
        .unary(WHO_AM_I, |req: Request<HelloRequest>| async move {
            let who = req.metadata().get_str("authorization").unwrap_or("anonymous");
            Ok(Response::new(HelloReply {
                message: who.to_owned(),
            }))
        })
        .unary(SLOW, |req: Request<HelloRequest>| async move {
            let delay = Duration::from_millis(req.message().delay_ms.into());
            tokio::select! {
                _ = tokio::time::sleep(delay) => Ok(Response::new(HelloReply { message: "done".into() })),
                _ = req.context().cancellation().cancelled() => Err(Status::cancelled("handler cancelled")),
            }
        })
        .unary(STUBBORN, |req: Request<HelloRequest>| async move {
            // Ignores cancellation on purpose.
            tokio::time::sleep(Duration::from_millis(req.message().delay_ms.into())).await;
            Ok(Response::new(HelloReply { message: "late".into() }))
        })
        .unary(FLAKY, move |_req: Request<HelloRequest>| {
            let attempt = flaky.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(Status::unavailable(format!("attempt {attempt} failed")))
                } else {
                    Ok(Response::new(HelloReply {
                        message: format!("attempt {attempt}"),
                    }))
                }
            }
        })
        .server_streaming(COUNT, |req: Request<CountRequest>| async move {
            let total = req.message().count;
            let mut metadata = Metadata::new();
            metadata.append("x-stream", "counter").ok();
            let mut trailers = Metadata::new();
            trailers.append("x-total", total.to_string()).ok();
            Ok(Response::new(ticks(req.into_message()))
                .with_metadata(metadata)
                .with_trailers(trailers))
        })
        .server_streaming(FAIL_AFTER, |req: Request<CountRequest>| async move {
            let req = req.into_message();
            let failing = futures::StreamExt::chain(
                ticks(req),
                futures::stream::once(async { Err(Status::aborted("counter gave up")) }),
            );
            Ok(Response::new(failing))
        })
        .server_streaming(PANIC_AFTER, |_req: Request<CountRequest>| async move {
            let panicking = async_stream::stream! {
                yield Ok::<_, Status>(Tick { n: 0 });
                panic!("counter exploded");
            };
            Ok(Response::new(panicking))
        })
        .unary(ECHO_METADATA, |req: Request<HelloRequest>| async move {
            let echo = echoed(req.metadata());
            Ok(Response::new(HelloReply::default())
                .with_metadata(echo.clone())
                .with_trailers(echo))
        })
        .server_streaming(ECHO_METADATA_STREAM, |req: Request<CountRequest>| async move {
            let echo = echoed(req.metadata());
            Ok(Response::new(ticks(req.into_message()))
                .with_metadata(echo.clone())
                .with_trailers(echo))
        })
}

pub async fn start(builder: ServerBuilder) -> ServerHandle {
    builder
        .build()
        .expect("valid server")
        .start("127.0.0.1:0")
        .await
        .expect("server starts")
}

pub fn channel_to(handle: &ServerHandle) -> Channel {
    Channel::insecure(&handle.local_addr().to_string()).expect("valid target")
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

pub const SAY_HELLO: &str = "/hello.Greeter/SayHello";
pub const SAY_HELLO_STREAM: &str = "/hello.Greeter/SayHelloStream";

/// Token the example server expects in the `authorization` header.
pub const DEMO_TOKEN: &str = "Bearer demo";

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct HelloRequest {
    #[prost(string, tag = "1")]
    #[serde(default)]
    pub name: String,
    #[prost(string, repeated, tag = "2")]
    #[serde(default)]
    pub hobbies: Vec<String>,
    /// Pause between streamed replies.
    #[prost(uint32, tag = "3")]
    #[serde(default)]
    pub delay_ms: u32,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct HelloReply {
    #[prost(string, tag = "1")]
    #[serde(default)]
    pub message: String,
}

/// Returns the server address from the PORT env var, defaulting to 3000.
///
/// ```ignore
/// let handle = server.start(wirecall_examples::server_addr()).await?;
/// ```
pub fn server_addr() -> SocketAddr {
    let port = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3000);
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Install a `tracing` subscriber honoring `RUST_LOG`.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,wirecall=debug,wirecall_client=debug".into()),
        )
        .init();
}

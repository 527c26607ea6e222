//! Protocol vocabulary shared by the `wirecall` server and `wirecall-client`.
//!
//! ## Modules
//!
//! - `status`: status codes, the error taxonomy and [`Status`]
//! - `metadata`: ordered call metadata with ASCII and binary values
//! - `codec`: protobuf / JSON message codec
//! - `envelope`: streaming envelope framing and the EndStream payload
//! - `timeout`: the `connect-timeout-ms` deadline header
//! - `method`: `/{service}/{method}` paths
//! - `limits`: message size limits

mod codec;
mod envelope;
mod limits;
mod metadata;
mod method;
mod status;
mod timeout;

pub use codec::*;
pub use envelope::*;
pub use limits::*;
pub use metadata::*;
pub use method::*;
pub use status::*;
pub use timeout::*;

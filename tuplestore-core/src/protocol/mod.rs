//! Wire protocol for the tuplestore binary request/response exchange.
//!
//! Each frame is a MessagePack unsigned-int length prefix followed by a
//! header map and a body map, both keyed by the numeric constants in
//! [`constants`]. The [`ClientCodec`] turns the byte stream into
//! [`Response`] envelopes and [`Request`] envelopes into bytes.

pub mod auth;
pub mod codec;
pub mod constants;
pub mod greeting;
pub mod request;
pub mod response;

pub use codec::ClientCodec;
pub use constants::IteratorType;
pub use greeting::Greeting;
pub use request::{Request, RequestBody, RequestType};
pub use response::Response;

//! Core protocol types for the tuplestore client.

#![warn(missing_docs)]

pub mod error;
pub mod protocol;

pub use error::{ServerErrorCode, TupleStoreError, Result};
pub use protocol::{ClientCodec, Greeting, IteratorType, Request, RequestBody, RequestType, Response};

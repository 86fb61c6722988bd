//! Async Rust client for a remote in-memory tuple store speaking the
//! length-prefixed binary protocol.
//!
//! The client multiplexes requests over a single TCP connection, discovers
//! the server-side schema lazily, codes tuple fields by their declared
//! types, and transparently retries an operation once when the server
//! reports a stale schema version.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use tuplestore_client::{ClientConfig, SelectOptions, TupleStoreClient, Value};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::builder()
//!         .host("127.0.0.1")
//!         .port(3301)
//!         .build()?;
//!     let client = TupleStoreClient::connect(config).await?;
//!
//!     client
//!         .insert("users", vec![Value::from(1u32), Value::from("alice")])
//!         .await?;
//!
//!     let rows = client
//!         .select("users", 0u32, vec![Value::from(1u32)], SelectOptions::new())
//!         .await?;
//!     println!("{:?}", rows[0].field("name"));
//!
//!     client.disconnect();
//!     Ok(())
//! }
//! ```
//!
//! # Layers
//!
//! | Layer | Module | Responsibility |
//! |-------|--------|----------------|
//! | Transport | [`connection`] | Socket ownership, framing, request multiplexing, timeouts, reconnect, handshake |
//! | Schema | [`schema`] | Space/index metadata cache, name resolution, field-value coding |
//! | Client | [`TupleStoreClient`] | Public operations, stale-schema retry, tuple decoding |

#![warn(missing_docs)]

pub mod client;
pub mod config;
pub mod connection;
pub mod schema;
pub mod tuple;
pub mod update;

pub use client::{SelectOptions, TupleStoreClient};
pub use config::{ClientConfig, ClientConfigBuilder, Credentials};
pub use connection::{ConnectionEvent, ConnectionId};
pub use schema::{
    FieldRef, FieldType, IndexDescriptor, IndexPart, IndexRef, Space, SpaceDescriptor,
    SpaceField, Spaces,
};
pub use tuple::Tuple;
pub use update::UpdateOp;

pub use rmpv::Value;
pub use tuplestore_core::{IteratorType, Result, ServerErrorCode, TupleStoreError};

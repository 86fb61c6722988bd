//! Connection ownership and request multiplexing.

#[allow(clippy::module_inception)]
pub mod connection;
pub mod transport;

pub use connection::{Connection, ConnectionId};
pub use transport::{ConnectionEvent, Transport};

//! A single TCP connection to the server.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder};

use tuplestore_core::protocol::auth::scramble;
use tuplestore_core::protocol::constants::GREETING_SIZE;
use tuplestore_core::protocol::request::{Request, RequestBody};
use tuplestore_core::protocol::response::Response;
use tuplestore_core::{ClientCodec, Greeting, Result, TupleStoreError};

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generates a new unique connection ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw ID value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// An established connection that has completed the greeting exchange.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    peer: String,
    stream: TcpStream,
    codec: ClientCodec,
    read_buffer: BytesMut,
    greeting: Greeting,
}

impl Connection {
    /// Opens a TCP connection and reads the server greeting.
    pub async fn open(address: &str) -> Result<Self> {
        let mut stream = TcpStream::connect(address).await.map_err(|e| {
            TupleStoreError::ConnectFailed(format!("failed to connect to {address}: {e}"))
        })?;

        stream.set_nodelay(true).map_err(|e| {
            TupleStoreError::ConnectFailed(format!("failed to set TCP_NODELAY: {e}"))
        })?;

        let mut raw = [0u8; GREETING_SIZE];
        stream.read_exact(&mut raw).await.map_err(|e| {
            TupleStoreError::ConnectFailed(format!("failed to read greeting from {address}: {e}"))
        })?;
        let greeting = Greeting::parse(&raw)?;

        tracing::debug!(address, banner = %greeting.banner, "established connection");
        Ok(Self {
            id: ConnectionId::new(),
            peer: address.to_string(),
            stream,
            codec: ClientCodec::new(),
            read_buffer: BytesMut::with_capacity(8192),
            greeting,
        })
    }

    /// Returns the connection's unique identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns the remote `host:port` this connection is attached to.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Returns the parsed server greeting.
    pub fn greeting(&self) -> &Greeting {
        &self.greeting
    }

    /// Runs the two-message authentication exchange.
    ///
    /// A rejection is terminal: the caller must not reconnect with the
    /// same credentials.
    pub async fn authenticate(&mut self, username: &str, password: &str) -> Result<()> {
        let scramble = scramble(&self.greeting.salt, password)?;
        let request = Request::new(
            0,
            None,
            RequestBody::Auth {
                user: username.to_string(),
                scramble,
            },
        );
        self.send(request).await?;

        let response = self.receive().await?.ok_or_else(|| {
            TupleStoreError::AuthFailed("server closed the connection during auth".to_string())
        })?;
        if let Some(code) = response.error_code() {
            return Err(TupleStoreError::AuthFailed(format!(
                "{code}: {}",
                response.error.unwrap_or_default()
            )));
        }

        tracing::debug!(id = %self.id, user = username, "authenticated");
        Ok(())
    }

    /// Sends one request over this connection.
    pub async fn send(&mut self, request: Request) -> Result<()> {
        let mut buf = BytesMut::new();
        self.codec.encode(request, &mut buf)?;
        self.stream.write_all(&buf).await.map_err(|e| {
            TupleStoreError::ConnectionLost(format!("failed to write to {}: {e}", self.peer))
        })?;
        Ok(())
    }

    /// Receives one response from this connection.
    ///
    /// Returns `None` when the connection is closed cleanly between frames.
    pub async fn receive(&mut self) -> Result<Option<Response>> {
        loop {
            if let Some(response) = self.codec.decode(&mut self.read_buffer)? {
                return Ok(Some(response));
            }

            let bytes_read = self
                .stream
                .read_buf(&mut self.read_buffer)
                .await
                .map_err(|e| {
                    TupleStoreError::ConnectionLost(format!(
                        "failed to read from {}: {e}",
                        self.peer
                    ))
                })?;

            if bytes_read == 0 {
                if self.read_buffer.is_empty() {
                    return Ok(None);
                }
                return Err(TupleStoreError::ConnectionLost(format!(
                    "connection to {} closed mid-frame",
                    self.peer
                )));
            }
        }
    }

    /// Splits the connection into independent read and write halves.
    pub fn split(self) -> (ConnectionReader, ConnectionWriter) {
        let (read_half, write_half) = self.stream.into_split();
        (
            ConnectionReader {
                id: self.id,
                peer: self.peer.clone(),
                half: read_half,
                codec: ClientCodec::new(),
                buffer: self.read_buffer,
            },
            ConnectionWriter {
                id: self.id,
                peer: self.peer,
                half: write_half,
                codec: self.codec,
            },
        )
    }
}

/// The read half of a split connection.
#[derive(Debug)]
pub struct ConnectionReader {
    id: ConnectionId,
    peer: String,
    half: OwnedReadHalf,
    codec: ClientCodec,
    buffer: BytesMut,
}

impl ConnectionReader {
    /// Receives one response; `None` on clean close between frames.
    pub async fn receive(&mut self) -> Result<Option<Response>> {
        loop {
            if let Some(response) = self.codec.decode(&mut self.buffer)? {
                return Ok(Some(response));
            }

            let bytes_read = self.half.read_buf(&mut self.buffer).await.map_err(|e| {
                TupleStoreError::ConnectionLost(format!("failed to read from {}: {e}", self.peer))
            })?;

            if bytes_read == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(TupleStoreError::ConnectionLost(format!(
                    "connection to {} closed mid-frame",
                    self.peer
                )));
            }
        }
    }

    /// Returns the connection's identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

/// The write half of a split connection.
#[derive(Debug)]
pub struct ConnectionWriter {
    id: ConnectionId,
    peer: String,
    half: OwnedWriteHalf,
    codec: ClientCodec,
}

impl ConnectionWriter {
    /// Sends one request.
    pub async fn send(&mut self, request: Request) -> Result<()> {
        let mut buf = BytesMut::new();
        self.codec.encode(request, &mut buf)?;
        self.half.write_all(&buf).await.map_err(|e| {
            TupleStoreError::ConnectionLost(format!("failed to write to {}: {e}", self.peer))
        })?;
        Ok(())
    }

    /// Returns the connection's identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use tokio::net::TcpListener;

    #[test]
    fn test_connection_id_uniqueness() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_connection_id_display() {
        let id = ConnectionId(42);
        assert_eq!(id.to_string(), "conn-42");
        assert_eq!(id.value(), 42);
    }

    fn greeting_bytes(banner: &str, salt: &[u8]) -> Vec<u8> {
        let mut raw = vec![b' '; GREETING_SIZE];
        raw[..banner.len()].copy_from_slice(banner.as_bytes());
        let encoded = STANDARD.encode(salt);
        raw[64..64 + encoded.len()].copy_from_slice(encoded.as_bytes());
        raw
    }

    #[tokio::test]
    async fn test_open_reads_greeting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let salt: Vec<u8> = (0..32).collect();
        let greeting = greeting_bytes("TupleStore 1.6.8 (Binary)", &salt);
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(&greeting).await.unwrap();
            // Hold the socket open until the client is done.
            let mut sink = vec![0u8; 16];
            let _ = socket.read_buf(&mut sink).await;
        });

        let connection = Connection::open(&address).await.unwrap();
        assert!(connection.greeting().banner.starts_with("TupleStore"));
        assert_eq!(connection.greeting().salt, salt);
        assert_eq!(connection.peer(), address);
    }

    #[tokio::test]
    async fn test_open_fails_on_refused_connect() {
        // Bind then drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = Connection::open(&address).await.unwrap_err();
        assert!(matches!(err, TupleStoreError::ConnectFailed(_)));
    }

    #[tokio::test]
    async fn test_open_fails_on_truncated_greeting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"short").await.unwrap();
        });

        let err = Connection::open(&address).await.unwrap_err();
        assert!(matches!(err, TupleStoreError::ConnectFailed(_)));
    }
}

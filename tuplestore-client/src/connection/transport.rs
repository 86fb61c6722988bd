//! Request multiplexing over a single connection.
//!
//! All connection state lives in one spawned task: callers hand requests to
//! the task over a channel and receive completions on oneshot channels, so
//! no user-visible call ever blocks on the socket. Requests are written to
//! the wire in acceptance order; replies are demultiplexed by their echoed
//! sync id and may complete in any order.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, instrument, warn};

use tuplestore_core::protocol::request::{Request, RequestBody};
use tuplestore_core::protocol::response::Response;
use tuplestore_core::{Result, TupleStoreError};

use super::connection::{Connection, ConnectionId, ConnectionWriter};
use crate::config::ClientConfig;

/// Events emitted during connection lifecycle.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Handshake completed; the transport accepts requests.
    Connected {
        /// The connection identifier.
        id: ConnectionId,
        /// The remote `host:port`.
        peer: String,
    },
    /// The connection was lost or shut down.
    Disconnected {
        /// The connection identifier.
        id: ConnectionId,
        /// The remote `host:port`.
        peer: String,
        /// The error that broke the connection, if any.
        error: Option<String>,
    },
}

enum Command {
    Invoke {
        body: RequestBody,
        schema_version: Option<u64>,
        reply: oneshot::Sender<Result<Response>>,
    },
}

/// Handle to the connection task.
#[derive(Debug)]
pub struct Transport {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ConnectionEvent>,
    shutdown: watch::Sender<bool>,
}

impl Transport {
    /// Establishes the initial connection and spawns the connection task.
    ///
    /// Honors `connect_timeout` and `connect_attempts`; when every attempt
    /// fails the error is returned unless `reconnect_always` is set, in
    /// which case the task keeps reconnecting in the background. An
    /// authentication rejection is always terminal.
    #[instrument(name = "transport.connect", skip(config), fields(address = %config.address()))]
    pub(crate) async fn connect(config: ClientConfig) -> Result<Self> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let connection = match initial_connect(&config).await {
            Ok(connection) => Some(connection),
            Err(err @ TupleStoreError::AuthFailed(_)) => return Err(err),
            Err(err) => {
                if config.reconnect_always() && config.reconnect_period().is_some() {
                    warn!(error = %err, "initial connect failed, retrying in background");
                    None
                } else {
                    return Err(err);
                }
            }
        };

        let task = TransportTask {
            config,
            commands: command_rx,
            events: event_tx.clone(),
            shutdown: shutdown_rx,
            pending: HashMap::new(),
            tombstones: HashSet::new(),
            next_sync: 0,
        };
        tokio::spawn(task.run(connection));

        Ok(Self {
            commands: command_tx,
            events: event_tx,
            shutdown: shutdown_tx,
        })
    }

    /// Enqueues a request and awaits its completion.
    pub(crate) async fn invoke(
        &self,
        body: RequestBody,
        schema_version: Option<u64>,
    ) -> Result<Response> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Invoke {
                body,
                schema_version,
                reply: reply_tx,
            })
            .map_err(|_| {
                TupleStoreError::ConnectionLost("connection task terminated".to_string())
            })?;
        reply_rx.await.map_err(|_| {
            TupleStoreError::ConnectionLost("request dropped during shutdown".to_string())
        })?
    }

    /// Subscribes to connection lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Tears the connection down, cancelling every pending request.
    pub(crate) fn disconnect(&self) {
        let _ = self.shutdown.send(true);
    }
}

async fn initial_connect(config: &ClientConfig) -> Result<Connection> {
    let attempts = config.connect_attempts().max(1);
    let mut last_error = None;
    for attempt in 1..=attempts {
        match establish(config).await {
            Ok(connection) => return Ok(connection),
            Err(err @ TupleStoreError::AuthFailed(_)) => return Err(err),
            Err(err) => {
                warn!(attempt, attempts, error = %err, "connect attempt failed");
                last_error = Some(err);
            }
        }
    }
    Err(last_error.expect("at least one connect attempt"))
}

/// One full handshake: TCP connect, greeting, and auth when configured.
async fn establish(config: &ClientConfig) -> Result<Connection> {
    let address = config.address();
    let mut connection =
        tokio::time::timeout(config.connect_timeout(), Connection::open(&address))
            .await
            .map_err(|_| {
                TupleStoreError::ConnectFailed(format!(
                    "connect to {address} timed out after {:?}",
                    config.connect_timeout()
                ))
            })??;

    if let Some(credentials) = config.credentials() {
        connection
            .authenticate(&credentials.username, &credentials.password)
            .await?;
    }
    Ok(connection)
}

struct PendingEntry {
    reply: oneshot::Sender<Result<Response>>,
    deadline: Option<Instant>,
}

enum Served {
    Shutdown,
    Broken,
}

enum Reestablished {
    Connection(Box<Connection>),
    Shutdown,
    Terminal(TupleStoreError),
}

struct TransportTask {
    config: ClientConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<ConnectionEvent>,
    shutdown: watch::Receiver<bool>,
    pending: HashMap<u32, PendingEntry>,
    tombstones: HashSet<u32>,
    next_sync: u32,
}

impl TransportTask {
    async fn run(mut self, mut connection: Option<Connection>) {
        loop {
            let conn = match connection.take() {
                Some(conn) => conn,
                None => match self.reestablish().await {
                    Reestablished::Connection(conn) => *conn,
                    Reestablished::Shutdown => return,
                    Reestablished::Terminal(err) => return self.serve_terminal(err).await,
                },
            };
            match self.serve(conn).await {
                Served::Shutdown => return,
                Served::Broken => {
                    if self.config.reconnect_period().is_none() {
                        let err = TupleStoreError::ConnectionLost(
                            "connection closed and reconnect is disabled".to_string(),
                        );
                        return self.serve_terminal(err).await;
                    }
                }
            }
        }
    }

    /// Runs the READY state on one connection until shutdown or breakage.
    async fn serve(&mut self, connection: Connection) -> Served {
        let id = connection.id();
        let peer = connection.peer().to_string();
        let _ = self.events.send(ConnectionEvent::Connected {
            id,
            peer: peer.clone(),
        });
        info!(%id, peer = %peer, "connection ready");

        let (mut reader, mut writer) = connection.split();
        let (response_tx, mut responses) = mpsc::unbounded_channel();
        let reader_task = tokio::spawn(async move {
            loop {
                let item = reader.receive().await;
                let done = !matches!(item, Ok(Some(_)));
                if response_tx.send(item).is_err() || done {
                    break;
                }
            }
        });

        let outcome = loop {
            let next_deadline = self.pending.values().filter_map(|p| p.deadline).min();
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        self.drain_pending(TupleStoreError::ConnectionLost(
                            "client disconnected".to_string(),
                        ));
                        break Ok(());
                    }
                }
                command = self.commands.recv() => match command {
                    None => {
                        self.drain_pending(TupleStoreError::ConnectionLost(
                            "client handle dropped".to_string(),
                        ));
                        break Ok(());
                    }
                    Some(Command::Invoke { body, schema_version, reply }) => {
                        if let Err(err) = self.submit(&mut writer, body, schema_version, reply).await {
                            break Err(err);
                        }
                    }
                },
                received = responses.recv() => match received {
                    Some(Ok(Some(response))) => self.dispatch(response),
                    Some(Ok(None)) => break Err(TupleStoreError::ConnectionLost(format!(
                        "server {peer} closed the connection"
                    ))),
                    Some(Err(err)) => break Err(err),
                    None => break Err(TupleStoreError::ConnectionLost(
                        "read loop terminated".to_string(),
                    )),
                },
                _ = sleep_until(next_deadline.unwrap_or_else(Instant::now)),
                    if next_deadline.is_some() =>
                {
                    self.expire_requests();
                }
            }
        };

        reader_task.abort();
        match outcome {
            Ok(()) => {
                let _ = self.events.send(ConnectionEvent::Disconnected {
                    id,
                    peer,
                    error: None,
                });
                Served::Shutdown
            }
            Err(err) => {
                warn!(%id, peer = %peer, error = %err, "connection broken");
                self.drain_pending(err.clone());
                // The connection is gone, so timed-out ids can never be
                // answered by a late reply any more.
                self.tombstones.clear();
                let _ = self.events.send(ConnectionEvent::Disconnected {
                    id,
                    peer,
                    error: Some(err.to_string()),
                });
                Served::Broken
            }
        }
    }

    async fn submit(
        &mut self,
        writer: &mut ConnectionWriter,
        body: RequestBody,
        schema_version: Option<u64>,
        reply: oneshot::Sender<Result<Response>>,
    ) -> Result<()> {
        if let Some(cap) = self.config.max_pending() {
            if self.pending.len() >= cap {
                let _ = reply.send(Err(TupleStoreError::PendingLimit(cap)));
                return Ok(());
            }
        }

        let sync = self.allocate_sync();
        let request = Request::new(sync, schema_version, body);
        if let Err(err) = writer.send(request).await {
            let _ = reply.send(Err(err.clone()));
            return Err(err);
        }

        let deadline = self.config.request_timeout().map(|t| Instant::now() + t);
        self.pending.insert(sync, PendingEntry { reply, deadline });
        Ok(())
    }

    /// Allocates the next sync id, skipping pending and timed-out ids.
    fn allocate_sync(&mut self) -> u32 {
        loop {
            self.next_sync = self.next_sync.wrapping_add(1);
            let sync = self.next_sync;
            if !self.pending.contains_key(&sync) && !self.tombstones.contains(&sync) {
                return sync;
            }
        }
    }

    fn dispatch(&mut self, response: Response) {
        let sync = response.sync;
        if let Some(entry) = self.pending.remove(&sync) {
            let _ = entry.reply.send(Ok(response));
        } else if self.tombstones.remove(&sync) {
            debug!(sync, "late reply for timed-out request");
        } else {
            warn!(sync, "reply for unknown request id, dropping");
        }
    }

    fn expire_requests(&mut self) {
        let now = Instant::now();
        let timeout = self.config.request_timeout().unwrap_or(Duration::ZERO);
        let expired: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, entry)| entry.deadline.is_some_and(|d| d <= now))
            .map(|(sync, _)| *sync)
            .collect();

        for sync in expired {
            if let Some(entry) = self.pending.remove(&sync) {
                // The id stays reserved until its late reply arrives or the
                // connection is torn down, so a stale response cannot be
                // mis-routed to a newer request.
                self.tombstones.insert(sync);
                let _ = entry.reply.send(Err(TupleStoreError::RequestTimeout(timeout)));
            }
        }
    }

    fn drain_pending(&mut self, err: TupleStoreError) {
        for (_, entry) in self.pending.drain() {
            let _ = entry.reply.send(Err(err.clone()));
        }
    }

    /// Waits out the reconnect period, then retries the handshake.
    #[instrument(name = "transport.reestablish", skip(self), fields(address = %self.config.address()))]
    async fn reestablish(&mut self) -> Reestablished {
        let Some(period) = self.config.reconnect_period() else {
            return Reestablished::Terminal(TupleStoreError::ConnectionLost(
                "not connected and reconnect is disabled".to_string(),
            ));
        };

        loop {
            if self.idle_wait(period).await {
                return Reestablished::Shutdown;
            }
            match establish(&self.config).await {
                Ok(connection) => {
                    info!(peer = %connection.peer(), "reconnected");
                    return Reestablished::Connection(Box::new(connection));
                }
                Err(err @ TupleStoreError::AuthFailed(_)) => {
                    warn!(error = %err, "authentication rejected during reconnect");
                    return Reestablished::Terminal(err);
                }
                Err(err) => {
                    warn!(error = %err, "reconnect attempt failed");
                }
            }
        }
    }

    /// Sleeps while broken, rejecting commands that arrive in the meantime.
    ///
    /// Returns `true` on shutdown.
    async fn idle_wait(&mut self, period: Duration) -> bool {
        let deadline = Instant::now() + period;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return false,
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return true;
                    }
                }
                command = self.commands.recv() => match command {
                    None => return true,
                    Some(command) => fail_command(
                        command,
                        TupleStoreError::ConnectionLost("not connected".to_string()),
                    ),
                },
            }
        }
    }

    /// Terminal state: every current and future request fails with `err`.
    async fn serve_terminal(&mut self, err: TupleStoreError) {
        debug!(error = %err, "transport entering terminal state");
        self.drain_pending(err.clone());
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return;
                    }
                }
                command = self.commands.recv() => match command {
                    None => return,
                    Some(command) => fail_command(command, err.clone()),
                },
            }
        }
    }
}

fn fail_command(command: Command, err: TupleStoreError) {
    let Command::Invoke { reply, .. } = command;
    let _ = reply.send(Err(err));
}

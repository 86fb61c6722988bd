//! Shared test harness: an in-process mock server speaking the binary
//! protocol, with fault injection hooks for the transport tests.

#![allow(dead_code)]

use std::cmp::Ordering;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::BytesMut;
use rmpv::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use tuplestore_core::protocol::auth::scramble;
use tuplestore_core::protocol::codec::decode_frame_length;
use tuplestore_core::protocol::constants::{GREETING_SIZE, VINDEX_ID, VSPACE_ID};
use tuplestore_core::protocol::request::{Request, RequestBody};
use tuplestore_core::protocol::response::Response;
use tuplestore_core::{IteratorType, ServerErrorCode};

use tuplestore_client::ClientConfig;

/// Fixed greeting salt used by every mock connection.
pub const SALT: [u8; 32] = [
    0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff,
    0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e,
    0x0f, 0x10,
];

#[derive(Debug, Clone)]
pub struct MockIndex {
    pub id: u32,
    pub name: String,
    /// `(field_no, type_name)` pairs.
    pub parts: Vec<(u32, String)>,
}

#[derive(Debug, Clone)]
pub struct MockSpace {
    pub id: u32,
    pub name: String,
    /// `(field_name, type_name)` pairs.
    pub format: Vec<(String, String)>,
    pub indexes: Vec<MockIndex>,
    pub tuples: Vec<Vec<Value>>,
}

impl MockSpace {
    fn index(&self, id: u32) -> Option<&MockIndex> {
        self.indexes.iter().find(|index| index.id == id)
    }

    fn key_of(&self, tuple: &[Value], index: &MockIndex) -> Vec<Value> {
        index
            .parts
            .iter()
            .filter_map(|(field_no, _)| tuple.get(*field_no as usize).cloned())
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct ServerState {
    pub schema_version: u64,
    pub spaces: Vec<MockSpace>,
    /// Expected `(user, password)`; `None` disables the auth gate.
    pub auth: Option<(String, String)>,
    /// Number of `_vspace` selects served, for discovery assertions.
    pub vspace_reads: usize,
    /// Read the next request but never answer it.
    pub swallow_next: bool,
    /// Read the next request, then close the connection without answering.
    pub drop_after_next: bool,
    /// Send one reply with this unknown sync before the next real reply.
    pub spurious_sync: Option<u32>,
    /// Answer every schema-tagged request with a stale-schema error.
    pub force_stale: bool,
}

pub struct MockServer {
    pub address: String,
    pub state: Arc<Mutex<ServerState>>,
    handle: tokio::task::JoinHandle<()>,
}

impl MockServer {
    pub async fn start(state: ServerState) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let state = Arc::new(Mutex::new(state));

        let accept_state = state.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(serve_connection(socket, accept_state.clone()));
            }
        });

        Self {
            address,
            state,
            handle,
        }
    }

    pub fn config(&self) -> ClientConfig {
        self.config_builder().build().unwrap()
    }

    pub fn config_builder(&self) -> tuplestore_client::ClientConfigBuilder {
        let (host, port) = self.host_port();
        ClientConfig::builder().host(host).port(port)
    }

    pub fn host_port(&self) -> (String, u16) {
        let (host, port) = self.address.rsplit_once(':').unwrap();
        (host.to_string(), port.parse().unwrap())
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// The standard test space: `items` at id 512 with a numeric primary key.
pub fn items_space() -> MockSpace {
    MockSpace {
        id: 512,
        name: "items".to_string(),
        format: vec![
            ("id".to_string(), "num".to_string()),
            ("name".to_string(), "str".to_string()),
            ("value".to_string(), "num".to_string()),
        ],
        indexes: vec![
            MockIndex {
                id: 0,
                name: "primary".to_string(),
                parts: vec![(0, "num".to_string())],
            },
            MockIndex {
                id: 1,
                name: "name".to_string(),
                parts: vec![(1, "str".to_string())],
            },
        ],
        tuples: Vec::new(),
    }
}

pub fn default_state() -> ServerState {
    ServerState {
        schema_version: 1,
        spaces: vec![items_space()],
        ..Default::default()
    }
}

pub async fn start_default() -> MockServer {
    MockServer::start(default_state()).await
}

async fn serve_connection(mut socket: TcpStream, state: Arc<Mutex<ServerState>>) {
    if socket.write_all(&greeting_bytes()).await.is_err() {
        return;
    }

    let mut buf = BytesMut::with_capacity(4096);
    let mut authed = false;
    loop {
        let Some(payload) = read_frame(&mut socket, &mut buf).await else {
            return;
        };
        let request = match Request::decode(&payload) {
            Ok(request) => request,
            Err(_) => return,
        };

        let mut state = state.lock().await;
        if state.swallow_next {
            state.swallow_next = false;
            continue;
        }
        let drop_connection = state.drop_after_next;
        if drop_connection {
            state.drop_after_next = false;
            return;
        }

        let mut wire = BytesMut::new();
        if let Some(sync) = state.spurious_sync.take() {
            let bogus = Response::ok(sync, Some(state.schema_version), None);
            bogus.encode(&mut wire).unwrap();
        }

        let response = handle_request(&mut state, request, &mut authed);
        drop(state);

        response.encode(&mut wire).unwrap();
        if socket.write_all(&wire).await.is_err() {
            return;
        }
    }
}

fn greeting_bytes() -> Vec<u8> {
    let mut raw = vec![b' '; GREETING_SIZE];
    let banner = b"TupleStore 1.6.8 (Binary) mock";
    raw[..banner.len()].copy_from_slice(banner);
    raw[63] = b'\n';
    let encoded = STANDARD.encode(SALT);
    raw[64..64 + encoded.len()].copy_from_slice(encoded.as_bytes());
    raw[127] = b'\n';
    raw
}

async fn read_frame(socket: &mut TcpStream, buf: &mut BytesMut) -> Option<Vec<u8>> {
    loop {
        if let Ok(Some((prefix_len, payload_len))) = decode_frame_length(buf) {
            if buf.len() >= prefix_len + payload_len {
                let mut frame = buf.split_to(prefix_len + payload_len);
                let payload = frame.split_off(prefix_len);
                return Some(payload.to_vec());
            }
        }
        match socket.read_buf(buf).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

fn handle_request(state: &mut ServerState, request: Request, authed: &mut bool) -> Response {
    let sync = request.sync;
    let version = Some(state.schema_version);

    if let RequestBody::Auth { user, scramble: provided } = &request.body {
        return match &state.auth {
            None => Response::ok(sync, version, None),
            Some((expected_user, password)) => {
                let expected = scramble(&SALT, password).unwrap();
                if user == expected_user && *provided == expected {
                    *authed = true;
                    Response::ok(sync, version, None)
                } else {
                    Response::server_error(
                        sync,
                        version,
                        ServerErrorCode::new(47),
                        format!("Incorrect password supplied for user '{user}'"),
                    )
                }
            }
        };
    }

    if state.auth.is_some() && !*authed {
        return Response::server_error(
            sync,
            version,
            ServerErrorCode::new(42),
            "Authentication required",
        );
    }

    // Metadata selects and pings are never version-checked; everything else
    // tagged with a stale version is rejected.
    let metadata_target = matches!(
        request.body,
        RequestBody::Select { space_id, .. } if space_id == VSPACE_ID || space_id == VINDEX_ID
    );
    if !metadata_target && !matches!(request.body, RequestBody::Ping) {
        if let Some(tagged) = request.schema_version {
            if state.force_stale || tagged != state.schema_version {
                return Response::server_error(
                    sync,
                    version,
                    ServerErrorCode::WRONG_SCHEMA_VERSION,
                    format!(
                        "Wrong schema version, current: {}, in request: {tagged}",
                        state.schema_version
                    ),
                );
            }
        } else if state.force_stale {
            return Response::server_error(
                sync,
                version,
                ServerErrorCode::WRONG_SCHEMA_VERSION,
                format!("Wrong schema version, current: {}", state.schema_version),
            );
        }
    }

    match request.body {
        RequestBody::Ping => Response::ok(sync, version, None),
        RequestBody::Auth { .. } => unreachable!("handled above"),
        RequestBody::Select {
            space_id,
            index_id,
            limit,
            offset,
            iterator,
            key,
        } => {
            if space_id == VSPACE_ID {
                state.vspace_reads += 1;
                return Response::ok(sync, version, Some(vspace_rows(state)));
            }
            if space_id == VINDEX_ID {
                return Response::ok(sync, version, Some(vindex_rows(state)));
            }
            match space_mut(state, space_id) {
                Err(error) => respond(error, sync, version),
                Ok(space) => match run_select(space, index_id, limit, offset, iterator, &key) {
                    Ok(rows) => Response::ok(sync, version, Some(rows)),
                    Err(error) => respond(error, sync, version),
                },
            }
        }
        RequestBody::Insert { space_id, tuple } => {
            match space_mut(state, space_id) {
                Err(error) => respond(error, sync, version),
                Ok(space) => {
                    let Some(primary) = space.index(0).cloned() else {
                        return respond(no_such_index(0), sync, version);
                    };
                    let key = space.key_of(&tuple, &primary);
                    if space
                        .tuples
                        .iter()
                        .any(|existing| space.key_of(existing, &primary) == key)
                    {
                        let message = format!(
                            "Duplicate key exists in unique index 'primary' in space '{}': tuple already exists",
                            space.name
                        );
                        return Response::server_error(
                            sync,
                            version,
                            ServerErrorCode::TUPLE_FOUND,
                            message,
                        );
                    }
                    space.tuples.push(tuple.clone());
                    Response::ok(sync, version, Some(vec![Value::Array(tuple)]))
                }
            }
        }
        RequestBody::Replace { space_id, tuple } => {
            match space_mut(state, space_id) {
                Err(error) => respond(error, sync, version),
                Ok(space) => {
                    let Some(primary) = space.index(0).cloned() else {
                        return respond(no_such_index(0), sync, version);
                    };
                    let key = space.key_of(&tuple, &primary);
                    space.tuples.retain(|existing| {
                        let existing_key = index_key(existing, &primary);
                        existing_key != key
                    });
                    space.tuples.push(tuple.clone());
                    Response::ok(sync, version, Some(vec![Value::Array(tuple)]))
                }
            }
        }
        RequestBody::Delete {
            space_id,
            index_id,
            key,
        } => {
            match space_mut(state, space_id) {
                Err(error) => respond(error, sync, version),
                Ok(space) => {
                    let Some(index) = space.index(index_id).cloned() else {
                        return respond(no_such_index(index_id), sync, version);
                    };
                    let mut removed = Vec::new();
                    space.tuples.retain(|tuple| {
                        if index_key(tuple, &index) == key {
                            removed.push(Value::Array(tuple.clone()));
                            false
                        } else {
                            true
                        }
                    });
                    Response::ok(sync, version, Some(removed))
                }
            }
        }
        RequestBody::Update {
            space_id,
            index_id,
            key,
            ops,
        } => {
            match space_mut(state, space_id) {
                Err(error) => respond(error, sync, version),
                Ok(space) => {
                    let Some(index) = space.index(index_id).cloned() else {
                        return respond(no_such_index(index_id), sync, version);
                    };
                    let position = space
                        .tuples
                        .iter()
                        .position(|tuple| index_key(tuple, &index) == key);
                    match position {
                        None => Response::ok(sync, version, Some(Vec::new())),
                        Some(position) => {
                            let mut tuple = space.tuples[position].clone();
                            if let Err(error) = apply_ops(&mut tuple, &ops) {
                                return respond(error, sync, version);
                            }
                            space.tuples[position] = tuple.clone();
                            Response::ok(sync, version, Some(vec![Value::Array(tuple)]))
                        }
                    }
                }
            }
        }
        RequestBody::Upsert {
            space_id,
            tuple,
            ops,
        } => {
            match space_mut(state, space_id) {
                Err(error) => respond(error, sync, version),
                Ok(space) => {
                    let Some(primary) = space.index(0).cloned() else {
                        return respond(no_such_index(0), sync, version);
                    };
                    let key = space.key_of(&tuple, &primary);
                    let position = space
                        .tuples
                        .iter()
                        .position(|existing| index_key(existing, &primary) == key);
                    match position {
                        None => space.tuples.push(tuple),
                        Some(position) => {
                            let mut existing = space.tuples[position].clone();
                            if let Err(error) = apply_ops(&mut existing, &ops) {
                                return respond(error, sync, version);
                            }
                            space.tuples[position] = existing;
                        }
                    }
                    Response::ok(sync, version, None)
                }
            }
        }
        RequestBody::Call { function, args } => match function.as_str() {
            "echo" => Response::ok(sync, version, Some(vec![Value::Array(args)])),
            _ => Response::server_error(
                sync,
                version,
                ServerErrorCode::new(33),
                format!("Procedure '{function}' is not defined"),
            ),
        },
    }
}

/// A server error waiting for its envelope.
struct PendingError(ServerErrorCode, String);

fn respond(error: PendingError, sync: u32, version: Option<u64>) -> Response {
    Response::server_error(sync, version, error.0, error.1)
}

fn no_such_space(space_id: u32) -> PendingError {
    PendingError(
        ServerErrorCode::NO_SUCH_SPACE,
        format!("Space '{space_id}' does not exist"),
    )
}

fn no_such_index(index_id: u32) -> PendingError {
    PendingError(
        ServerErrorCode::new(35),
        format!("No index #{index_id} is defined"),
    )
}

fn space_mut(state: &mut ServerState, space_id: u32) -> Result<&mut MockSpace, PendingError> {
    state
        .spaces
        .iter_mut()
        .find(|space| space.id == space_id)
        .ok_or_else(|| no_such_space(space_id))
}

fn index_key(tuple: &[Value], index: &MockIndex) -> Vec<Value> {
    index
        .parts
        .iter()
        .filter_map(|(field_no, _)| tuple.get(*field_no as usize).cloned())
        .collect()
}

fn vspace_rows(state: &ServerState) -> Vec<Value> {
    state
        .spaces
        .iter()
        .map(|space| {
            let format = space
                .format
                .iter()
                .map(|(name, type_name)| {
                    Value::Map(vec![
                        (Value::from("name"), Value::from(name.as_str())),
                        (Value::from("type"), Value::from(type_name.as_str())),
                    ])
                })
                .collect();
            Value::Array(vec![
                Value::from(space.id),
                Value::from(1u32),
                Value::from(space.name.as_str()),
                Value::from("memtx"),
                Value::from(0u32),
                Value::Map(Vec::new()),
                Value::Array(format),
            ])
        })
        .collect()
}

fn vindex_rows(state: &ServerState) -> Vec<Value> {
    let mut rows = Vec::new();
    for space in &state.spaces {
        for index in &space.indexes {
            let parts = index
                .parts
                .iter()
                .map(|(field_no, type_name)| {
                    Value::Array(vec![
                        Value::from(*field_no),
                        Value::from(type_name.as_str()),
                    ])
                })
                .collect();
            rows.push(Value::Array(vec![
                Value::from(space.id),
                Value::from(index.id),
                Value::from(index.name.as_str()),
                Value::from("tree"),
                Value::Map(Vec::new()),
                Value::Array(parts),
            ]));
        }
    }
    rows
}

fn run_select(
    space: &MockSpace,
    index_id: u32,
    limit: u32,
    offset: u32,
    iterator: IteratorType,
    key: &[Value],
) -> Result<Vec<Value>, PendingError> {
    let index = space.index(index_id).ok_or_else(|| no_such_index(index_id))?;

    let matches: Vec<Value> = space
        .tuples
        .iter()
        .filter(|tuple| {
            if key.is_empty() {
                return true;
            }
            let tuple_key = index_key(tuple, index);
            let prefix: Vec<Value> = tuple_key.iter().take(key.len()).cloned().collect();
            match iterator {
                IteratorType::All => true,
                IteratorType::Eq => prefix == key,
                IteratorType::Lt => cmp_keys(&prefix, key) == Ordering::Less,
                IteratorType::Le => cmp_keys(&prefix, key) != Ordering::Greater,
                IteratorType::Ge => cmp_keys(&prefix, key) != Ordering::Less,
                IteratorType::Gt => cmp_keys(&prefix, key) == Ordering::Greater,
            }
        })
        .skip(offset as usize)
        .take(limit as usize)
        .map(|tuple| Value::Array(tuple.clone()))
        .collect();

    Ok(matches)
}

fn cmp_keys(a: &[Value], b: &[Value]) -> Ordering {
    for (left, right) in a.iter().zip(b.iter()) {
        let ordering = match (numeric(left), numeric(right)) {
            (Some(l), Some(r)) => l.cmp(&r),
            _ => raw_bytes(left).cmp(&raw_bytes(right)),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    a.len().cmp(&b.len())
}

fn numeric(value: &Value) -> Option<u64> {
    match value {
        Value::Integer(_) => value.as_u64(),
        Value::Binary(bytes) if bytes.len() == 4 => {
            let mut le = [0u8; 4];
            le.copy_from_slice(bytes);
            Some(u64::from(u32::from_le_bytes(le)))
        }
        Value::Binary(bytes) if bytes.len() == 8 => {
            let mut le = [0u8; 8];
            le.copy_from_slice(bytes);
            Some(u64::from_le_bytes(le))
        }
        _ => None,
    }
}

fn raw_bytes(value: &Value) -> Vec<u8> {
    match value {
        Value::Binary(bytes) => bytes.clone(),
        Value::String(s) => s.as_bytes().to_vec(),
        other => format!("{other:?}").into_bytes(),
    }
}

fn apply_ops(tuple: &mut Vec<Value>, ops: &[Value]) -> Result<(), PendingError> {
    for op in ops {
        let Value::Array(parts) = op else {
            return Err(bad_op("operation is not an array"));
        };
        let code = match parts.first() {
            Some(Value::String(s)) => s.as_str().unwrap_or_default().to_string(),
            _ => return Err(bad_op("operation has no code")),
        };
        let field = parts
            .get(1)
            .and_then(Value::as_u64)
            .ok_or_else(|| bad_op("operation has no field number"))? as usize;

        match code.as_str() {
            "=" => {
                let value = parts.get(2).cloned().ok_or_else(|| bad_op("= needs a value"))?;
                match field.cmp(&tuple.len()) {
                    Ordering::Less => tuple[field] = value,
                    Ordering::Equal => tuple.push(value),
                    Ordering::Greater => return Err(update_field_error(field)),
                }
            }
            "+" | "-" | "&" | "|" | "^" => {
                let argument = parts
                    .get(2)
                    .and_then(Value::as_u64)
                    .ok_or_else(|| bad_op("arithmetic needs an integer argument"))?;
                let slot = tuple.get_mut(field).ok_or_else(|| update_field_error(field))?;
                let (current, width) = match numeric(slot) {
                    Some(n) => (n, byte_width(slot)),
                    None => return Err(update_field_error(field)),
                };
                let result = match code.as_str() {
                    "+" => current.wrapping_add(argument),
                    "-" => current.wrapping_sub(argument),
                    "&" => current & argument,
                    "|" => current | argument,
                    _ => current ^ argument,
                };
                *slot = renumber(result, width);
            }
            ":" => {
                let offset = parts.get(2).and_then(Value::as_u64).unwrap_or(0) as usize;
                let length = parts.get(3).and_then(Value::as_u64).unwrap_or(0) as usize;
                let replacement = parts.get(4).map(raw_bytes).unwrap_or_default();
                let slot = tuple.get_mut(field).ok_or_else(|| update_field_error(field))?;

                let was_string = matches!(slot, Value::String(_));
                let mut bytes = raw_bytes(slot);
                let start = offset.min(bytes.len());
                let end = (start + length).min(bytes.len());
                bytes.splice(start..end, replacement);

                *slot = if was_string {
                    match String::from_utf8(bytes.clone()) {
                        Ok(s) => Value::from(s),
                        Err(_) => Value::Binary(bytes),
                    }
                } else {
                    Value::Binary(bytes)
                };
            }
            "#" => {
                let count = parts.get(2).and_then(Value::as_u64).unwrap_or(1) as usize;
                if field >= tuple.len() {
                    return Err(update_field_error(field));
                }
                let end = (field + count).min(tuple.len());
                tuple.drain(field..end);
            }
            "!" => {
                let value = parts.get(2).cloned().ok_or_else(|| bad_op("! needs a value"))?;
                let position = field.min(tuple.len());
                tuple.insert(position, value);
            }
            other => return Err(bad_op(format!("unknown operation '{other}'"))),
        }
    }
    Ok(())
}

fn byte_width(value: &Value) -> usize {
    match value {
        Value::Binary(bytes) => bytes.len(),
        _ => 0,
    }
}

fn renumber(value: u64, width: usize) -> Value {
    match width {
        4 => Value::Binary((value as u32).to_le_bytes().to_vec()),
        8 => Value::Binary(value.to_le_bytes().to_vec()),
        _ => Value::from(value),
    }
}

fn bad_op(detail: impl Into<String>) -> PendingError {
    PendingError(ServerErrorCode::new(28), detail.into())
}

fn update_field_error(field: usize) -> PendingError {
    PendingError(
        ServerErrorCode::new(29),
        format!("Field {field} update error"),
    )
}

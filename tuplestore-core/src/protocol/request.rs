//! Request envelope and its wire encoding.

use bytes::{BufMut, BytesMut};
use rmpv::Value;

use super::constants::*;
use crate::error::{Result, TupleStoreError};

/// Request type codes of the binary protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestType {
    /// Select tuples by key.
    Select = 1,
    /// Insert a tuple; duplicate keys are rejected.
    Insert = 2,
    /// Insert or overwrite a tuple.
    Replace = 3,
    /// Apply update operations to one tuple.
    Update = 4,
    /// Delete tuples by key.
    Delete = 5,
    /// Authenticate the connection.
    Auth = 7,
    /// Apply update operations, inserting the tuple when absent.
    Upsert = 9,
    /// Call a server-side procedure.
    Call = 10,
    /// Liveness probe; also carries the current schema version back.
    Ping = 64,
}

impl RequestType {
    /// Creates a request type from its wire code.
    pub fn from_value(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::Select),
            2 => Some(Self::Insert),
            3 => Some(Self::Replace),
            4 => Some(Self::Update),
            5 => Some(Self::Delete),
            7 => Some(Self::Auth),
            9 => Some(Self::Upsert),
            10 => Some(Self::Call),
            64 => Some(Self::Ping),
            _ => None,
        }
    }

    /// Returns the wire code of this request type.
    pub fn value(self) -> u64 {
        self as u64
    }
}

/// The type-specific body of a request.
///
/// Tuple, key, and op values are already coded for the wire; the schema
/// layer above is responsible for field-type coding.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    /// Liveness probe.
    Ping,
    /// Authentication with a scrambled password.
    Auth {
        /// User name.
        user: String,
        /// Challenge-response scramble derived from the greeting salt.
        scramble: Vec<u8>,
    },
    /// Select by key.
    Select {
        /// Target space.
        space_id: u32,
        /// Index to search.
        index_id: u32,
        /// Maximum number of tuples to return.
        limit: u32,
        /// Number of matching tuples to skip.
        offset: u32,
        /// Search direction and inclusivity.
        iterator: IteratorType,
        /// Key values.
        key: Vec<Value>,
    },
    /// Insert a tuple.
    Insert {
        /// Target space.
        space_id: u32,
        /// Tuple values.
        tuple: Vec<Value>,
    },
    /// Insert or overwrite a tuple.
    Replace {
        /// Target space.
        space_id: u32,
        /// Tuple values.
        tuple: Vec<Value>,
    },
    /// Apply update operations to the tuple matching a key.
    Update {
        /// Target space.
        space_id: u32,
        /// Index the key addresses.
        index_id: u32,
        /// Key values.
        key: Vec<Value>,
        /// Encoded update operations.
        ops: Vec<Value>,
    },
    /// Update-or-insert.
    Upsert {
        /// Target space.
        space_id: u32,
        /// Tuple to insert when no match exists.
        tuple: Vec<Value>,
        /// Encoded update operations.
        ops: Vec<Value>,
    },
    /// Delete by key.
    Delete {
        /// Target space.
        space_id: u32,
        /// Index the key addresses.
        index_id: u32,
        /// Key values.
        key: Vec<Value>,
    },
    /// Call a server-side procedure.
    Call {
        /// Procedure name.
        function: String,
        /// Call arguments.
        args: Vec<Value>,
    },
}

impl RequestBody {
    /// Returns the request type this body is sent as.
    pub fn request_type(&self) -> RequestType {
        match self {
            Self::Ping => RequestType::Ping,
            Self::Auth { .. } => RequestType::Auth,
            Self::Select { .. } => RequestType::Select,
            Self::Insert { .. } => RequestType::Insert,
            Self::Replace { .. } => RequestType::Replace,
            Self::Update { .. } => RequestType::Update,
            Self::Upsert { .. } => RequestType::Upsert,
            Self::Delete { .. } => RequestType::Delete,
            Self::Call { .. } => RequestType::Call,
        }
    }

    fn to_map(&self) -> Vec<(Value, Value)> {
        match self {
            Self::Ping => Vec::new(),
            Self::Auth { user, scramble } => vec![
                (Value::from(KEY_USER_NAME), Value::from(user.as_str())),
                (
                    Value::from(KEY_TUPLE),
                    Value::Array(vec![
                        Value::from(AUTH_MECHANISM),
                        Value::Binary(scramble.clone()),
                    ]),
                ),
            ],
            Self::Select {
                space_id,
                index_id,
                limit,
                offset,
                iterator,
                key,
            } => vec![
                (Value::from(KEY_SPACE_ID), Value::from(*space_id)),
                (Value::from(KEY_INDEX_ID), Value::from(*index_id)),
                (Value::from(KEY_LIMIT), Value::from(*limit)),
                (Value::from(KEY_OFFSET), Value::from(*offset)),
                (Value::from(KEY_ITERATOR), Value::from(iterator.value())),
                (Value::from(KEY_KEY), Value::Array(key.clone())),
            ],
            Self::Insert { space_id, tuple } | Self::Replace { space_id, tuple } => vec![
                (Value::from(KEY_SPACE_ID), Value::from(*space_id)),
                (Value::from(KEY_TUPLE), Value::Array(tuple.clone())),
            ],
            Self::Update {
                space_id,
                index_id,
                key,
                ops,
            } => vec![
                (Value::from(KEY_SPACE_ID), Value::from(*space_id)),
                (Value::from(KEY_INDEX_ID), Value::from(*index_id)),
                (Value::from(KEY_KEY), Value::Array(key.clone())),
                (Value::from(KEY_TUPLE), Value::Array(ops.clone())),
            ],
            Self::Upsert {
                space_id,
                tuple,
                ops,
            } => vec![
                (Value::from(KEY_SPACE_ID), Value::from(*space_id)),
                (Value::from(KEY_TUPLE), Value::Array(tuple.clone())),
                (Value::from(KEY_OPS), Value::Array(ops.clone())),
            ],
            Self::Delete {
                space_id,
                index_id,
                key,
            } => vec![
                (Value::from(KEY_SPACE_ID), Value::from(*space_id)),
                (Value::from(KEY_INDEX_ID), Value::from(*index_id)),
                (Value::from(KEY_KEY), Value::Array(key.clone())),
            ],
            Self::Call { function, args } => vec![
                (Value::from(KEY_FUNCTION_NAME), Value::from(function.as_str())),
                (Value::from(KEY_TUPLE), Value::Array(args.clone())),
            ],
        }
    }

    /// Rebuilds a body from a decoded body map.
    pub fn from_map(request_type: RequestType, map: &[(Value, Value)]) -> Result<Self> {
        let space_id = || {
            map_u64(map, KEY_SPACE_ID)
                .map(|v| v as u32)
                .ok_or_else(|| protocol_error("missing space id"))
        };
        let index_id = || map_u64(map, KEY_INDEX_ID).map(|v| v as u32).unwrap_or(0);
        let key = || map_array(map, KEY_KEY).unwrap_or_default();
        let tuple = |what: &str| {
            map_array(map, KEY_TUPLE)
                .ok_or_else(|| protocol_error(format!("missing {what}")))
        };

        Ok(match request_type {
            RequestType::Ping => Self::Ping,
            RequestType::Auth => {
                let user = map_str(map, KEY_USER_NAME)
                    .ok_or_else(|| protocol_error("missing user name"))?;
                let creds = tuple("auth credentials")?;
                let scramble = match creds.get(1) {
                    Some(Value::Binary(bytes)) => bytes.clone(),
                    Some(Value::String(s)) => s.as_bytes().to_vec(),
                    _ => return Err(protocol_error("missing auth scramble")),
                };
                Self::Auth { user, scramble }
            }
            RequestType::Select => {
                let iterator = map_u64(map, KEY_ITERATOR)
                    .map(|v| {
                        IteratorType::from_value(v)
                            .ok_or_else(|| protocol_error(format!("unknown iterator {v}")))
                    })
                    .transpose()?
                    .unwrap_or_default();
                Self::Select {
                    space_id: space_id()?,
                    index_id: index_id(),
                    limit: map_u64(map, KEY_LIMIT).map(|v| v as u32).unwrap_or(u32::MAX),
                    offset: map_u64(map, KEY_OFFSET).map(|v| v as u32).unwrap_or(0),
                    iterator,
                    key: key(),
                }
            }
            RequestType::Insert => Self::Insert {
                space_id: space_id()?,
                tuple: tuple("tuple")?,
            },
            RequestType::Replace => Self::Replace {
                space_id: space_id()?,
                tuple: tuple("tuple")?,
            },
            RequestType::Update => Self::Update {
                space_id: space_id()?,
                index_id: index_id(),
                key: key(),
                ops: tuple("update operations")?,
            },
            RequestType::Upsert => Self::Upsert {
                space_id: space_id()?,
                tuple: tuple("tuple")?,
                ops: map_array(map, KEY_OPS)
                    .ok_or_else(|| protocol_error("missing upsert operations"))?,
            },
            RequestType::Delete => Self::Delete {
                space_id: space_id()?,
                index_id: index_id(),
                key: key(),
            },
            RequestType::Call => Self::Call {
                function: map_str(map, KEY_FUNCTION_NAME)
                    .ok_or_else(|| protocol_error("missing function name"))?,
                args: map_array(map, KEY_TUPLE).unwrap_or_default(),
            },
        })
    }
}

/// A request envelope: type, per-connection id, schema version, and body.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Per-connection request id, echoed in the reply.
    pub sync: u32,
    /// Schema version the request was planned against, if any.
    ///
    /// Absent for pre-schema operations such as ping and auth.
    pub schema_version: Option<u64>,
    /// The type-specific body.
    pub body: RequestBody,
}

impl Request {
    /// Creates a new request envelope.
    pub fn new(sync: u32, schema_version: Option<u64>, body: RequestBody) -> Self {
        Self {
            sync,
            schema_version,
            body,
        }
    }

    /// Encodes this request as a complete frame (length prefix included).
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        let mut header = Vec::with_capacity(3);
        header.push((
            Value::from(KEY_CODE),
            Value::from(self.body.request_type().value()),
        ));
        header.push((Value::from(KEY_SYNC), Value::from(self.sync)));
        if let Some(version) = self.schema_version {
            header.push((Value::from(KEY_SCHEMA_VERSION), Value::from(version)));
        }

        let mut payload = Vec::with_capacity(64);
        write_value(&mut payload, &Value::Map(header))?;
        write_value(&mut payload, &Value::Map(self.body.to_map()))?;

        let mut prefix = Vec::with_capacity(5);
        rmp::encode::write_u32(&mut prefix, payload.len() as u32)
            .map_err(|e| protocol_error(format!("failed to encode frame length: {e}")))?;

        dst.reserve(prefix.len() + payload.len());
        dst.put_slice(&prefix);
        dst.put_slice(&payload);
        Ok(())
    }

    /// Decodes a request from a frame payload (length prefix stripped).
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut rd = payload;
        let header = read_map(&mut rd, "request header")?;
        let body = if rd.is_empty() {
            Vec::new()
        } else {
            read_map(&mut rd, "request body")?
        };

        let type_code = map_u64(&header, KEY_CODE)
            .ok_or_else(|| protocol_error("missing request type"))?;
        let request_type = RequestType::from_value(type_code)
            .ok_or_else(|| protocol_error(format!("unknown request type {type_code}")))?;

        Ok(Self {
            sync: map_u64(&header, KEY_SYNC).unwrap_or(0) as u32,
            schema_version: map_u64(&header, KEY_SCHEMA_VERSION),
            body: RequestBody::from_map(request_type, &body)?,
        })
    }
}

pub(crate) fn protocol_error(detail: impl Into<String>) -> TupleStoreError {
    TupleStoreError::Protocol(detail.into())
}

pub(crate) fn write_value(wr: &mut Vec<u8>, value: &Value) -> Result<()> {
    rmpv::encode::write_value(wr, value)
        .map_err(|e| protocol_error(format!("failed to encode value: {e}")))
}

pub(crate) fn read_map(rd: &mut &[u8], what: &str) -> Result<Vec<(Value, Value)>> {
    match rmpv::decode::read_value(rd) {
        Ok(Value::Map(map)) => Ok(map),
        Ok(other) => Err(protocol_error(format!(
            "expected {what} map, got {other:?}"
        ))),
        Err(e) => Err(protocol_error(format!("failed to decode {what}: {e}"))),
    }
}

pub(crate) fn map_get<'a>(map: &'a [(Value, Value)], key: u64) -> Option<&'a Value> {
    map.iter()
        .find(|(k, _)| k.as_u64() == Some(key))
        .map(|(_, v)| v)
}

pub(crate) fn map_u64(map: &[(Value, Value)], key: u64) -> Option<u64> {
    map_get(map, key).and_then(Value::as_u64)
}

pub(crate) fn map_str(map: &[(Value, Value)], key: u64) -> Option<String> {
    match map_get(map, key) {
        Some(Value::String(s)) => s.as_str().map(str::to_owned),
        _ => None,
    }
}

pub(crate) fn map_array(map: &[(Value, Value)], key: u64) -> Option<Vec<Value>> {
    match map_get(map, key) {
        Some(Value::Array(items)) => Some(items.clone()),
        _ => None,
    }
}

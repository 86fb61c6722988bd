//! Error types for tuplestore operations.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Bit set in a response code when the reply reports an error.
///
/// The low 15 bits of such a code carry the server's error class.
pub const ERROR_TYPE_FLAG: u32 = 0x8000;

/// A server-side error class, extracted from the low bits of a response code.
///
/// The numeric values are part of the wire contract with the server and must
/// not be remapped. Exactly one class, [`ServerErrorCode::WRONG_SCHEMA_VERSION`],
/// drives the client's internal schema refresh; every other class is
/// surfaced to the caller unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerErrorCode(u16);

impl ServerErrorCode {
    /// A tuple with the same primary key already exists.
    pub const TUPLE_FOUND: ServerErrorCode = ServerErrorCode(3);
    /// The requested space does not exist on the server.
    pub const NO_SUCH_SPACE: ServerErrorCode = ServerErrorCode(36);
    /// The request was planned against an obsolete schema version.
    pub const WRONG_SCHEMA_VERSION: ServerErrorCode = ServerErrorCode(109);

    /// Creates an error class from its raw numeric value.
    pub fn new(value: u16) -> Self {
        Self(value)
    }

    /// Extracts the error class from a response code.
    ///
    /// Returns `None` when the code does not have the error bit set.
    pub fn from_response_code(code: u32) -> Option<Self> {
        if code & ERROR_TYPE_FLAG != 0 {
            Some(Self((code & !ERROR_TYPE_FLAG) as u16))
        } else {
            None
        }
    }

    /// Returns the raw numeric value of this class.
    pub fn value(self) -> u16 {
        self.0
    }

    /// Returns the full response code for this class (error bit included).
    pub fn response_code(self) -> u32 {
        ERROR_TYPE_FLAG | u32::from(self.0)
    }

    /// Returns `true` if this class reports a stale schema version.
    pub fn is_schema_mismatch(self) -> bool {
        self == Self::WRONG_SCHEMA_VERSION
    }

    /// Returns the symbolic name of this class, if it is a known one.
    ///
    /// The table mirrors the server's error code list; unknown classes
    /// return `None` and are displayed with a synthesized name instead.
    pub fn name(self) -> Option<&'static str> {
        Some(match self.0 {
            0 => "ER_UNKNOWN",
            1 => "ER_ILLEGAL_PARAMS",
            2 => "ER_MEMORY_ISSUE",
            3 => "ER_TUPLE_FOUND",
            4 => "ER_TUPLE_NOT_FOUND",
            5 => "ER_UNSUPPORTED",
            6 => "ER_NONMASTER",
            7 => "ER_READONLY",
            8 => "ER_INJECTION",
            9 => "ER_CREATE_SPACE",
            10 => "ER_SPACE_EXISTS",
            11 => "ER_DROP_SPACE",
            12 => "ER_ALTER_SPACE",
            13 => "ER_INDEX_TYPE",
            14 => "ER_MODIFY_INDEX",
            15 => "ER_LAST_DROP",
            16 => "ER_TUPLE_FORMAT_LIMIT",
            17 => "ER_DROP_PRIMARY_KEY",
            18 => "ER_KEY_PART_TYPE",
            19 => "ER_EXACT_MATCH",
            20 => "ER_INVALID_MSGPACK",
            21 => "ER_PROC_RET",
            22 => "ER_TUPLE_NOT_ARRAY",
            23 => "ER_FIELD_TYPE",
            24 => "ER_FIELD_TYPE_MISMATCH",
            25 => "ER_SPLICE",
            26 => "ER_ARG_TYPE",
            27 => "ER_TUPLE_IS_TOO_LONG",
            28 => "ER_UNKNOWN_UPDATE_OP",
            29 => "ER_UPDATE_FIELD",
            30 => "ER_FIBER_STACK",
            31 => "ER_KEY_PART_COUNT",
            32 => "ER_PROC_LUA",
            33 => "ER_NO_SUCH_PROC",
            34 => "ER_NO_SUCH_TRIGGER",
            35 => "ER_NO_SUCH_INDEX",
            36 => "ER_NO_SUCH_SPACE",
            37 => "ER_NO_SUCH_FIELD",
            38 => "ER_EXACT_FIELD_COUNT",
            39 => "ER_INDEX_FIELD_COUNT",
            40 => "ER_WAL_IO",
            41 => "ER_MORE_THAN_ONE_TUPLE",
            42 => "ER_ACCESS_DENIED",
            43 => "ER_CREATE_USER",
            44 => "ER_DROP_USER",
            45 => "ER_NO_SUCH_USER",
            46 => "ER_USER_EXISTS",
            47 => "ER_PASSWORD_MISMATCH",
            48 => "ER_UNKNOWN_REQUEST_TYPE",
            49 => "ER_UNKNOWN_SCHEMA_OBJECT",
            50 => "ER_CREATE_FUNCTION",
            51 => "ER_NO_SUCH_FUNCTION",
            52 => "ER_FUNCTION_EXISTS",
            53 => "ER_FUNCTION_ACCESS_DENIED",
            54 => "ER_FUNCTION_MAX",
            55 => "ER_SPACE_ACCESS_DENIED",
            56 => "ER_USER_MAX",
            57 => "ER_NO_SUCH_ENGINE",
            58 => "ER_RELOAD_CFG",
            59 => "ER_CFG",
            60 => "ER_SOPHIA",
            61 => "ER_LOCAL_SERVER_IS_NOT_ACTIVE",
            62 => "ER_UNKNOWN_SERVER",
            63 => "ER_CLUSTER_ID_MISMATCH",
            64 => "ER_INVALID_UUID",
            65 => "ER_CLUSTER_ID_IS_RO",
            66 => "ER_RESERVED66",
            67 => "ER_SERVER_ID_IS_RESERVED",
            68 => "ER_INVALID_ORDER",
            69 => "ER_MISSING_REQUEST_FIELD",
            70 => "ER_IDENTIFIER",
            71 => "ER_DROP_FUNCTION",
            72 => "ER_ITERATOR_TYPE",
            73 => "ER_REPLICA_MAX",
            74 => "ER_INVALID_XLOG",
            75 => "ER_INVALID_XLOG_NAME",
            76 => "ER_INVALID_XLOG_ORDER",
            77 => "ER_NO_CONNECTION",
            78 => "ER_TIMEOUT",
            79 => "ER_ACTIVE_TRANSACTION",
            80 => "ER_NO_ACTIVE_TRANSACTION",
            81 => "ER_CROSS_ENGINE_TRANSACTION",
            82 => "ER_NO_SUCH_ROLE",
            83 => "ER_ROLE_EXISTS",
            84 => "ER_CREATE_ROLE",
            85 => "ER_INDEX_EXISTS",
            86 => "ER_TUPLE_REF_OVERFLOW",
            87 => "ER_ROLE_LOOP",
            88 => "ER_GRANT",
            89 => "ER_PRIV_GRANTED",
            90 => "ER_ROLE_GRANTED",
            91 => "ER_PRIV_NOT_GRANTED",
            92 => "ER_ROLE_NOT_GRANTED",
            93 => "ER_MISSING_SNAPSHOT",
            94 => "ER_CANT_UPDATE_PRIMARY_KEY",
            95 => "ER_UPDATE_INTEGER_OVERFLOW",
            96 => "ER_GUEST_USER_PASSWORD",
            97 => "ER_TRANSACTION_CONFLICT",
            98 => "ER_UNSUPPORTED_ROLE_PRIV",
            99 => "ER_LOAD_FUNCTION",
            100 => "ER_FUNCTION_LANGUAGE",
            101 => "ER_RTREE_RECT",
            102 => "ER_PROC_C",
            103 => "ER_UNKNOWN_RTREE_INDEX_DISTANCE_TYPE",
            104 => "ER_PROTOCOL",
            105 => "ER_UPSERT_UNIQUE_SECONDARY_KEY",
            106 => "ER_WRONG_INDEX_RECORD",
            107 => "ER_WRONG_INDEX_PARTS",
            108 => "ER_WRONG_INDEX_OPTIONS",
            109 => "ER_WRONG_SCHEMA_VERSION",
            110 => "ER_SLAB_ALLOC_MAX",
            111 => "ER_WRONG_SPACE_OPTIONS",
            112 => "ER_UNSUPPORTED_INDEX_FEATURE",
            113 => "ER_VIEW_IS_RO",
            _ => return None,
        })
    }
}

impl fmt::Display for ServerErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "ER_UNKNOWN_{}", self.0),
        }
    }
}

/// The main error type for tuplestore operations.
///
/// Transport-level variants are fatal to the in-flight request but leave the
/// caller's program running; [`TupleStoreError::Server`] carries a well-formed
/// error reply and leaves the connection healthy.
#[derive(Debug, Error, Clone)]
pub enum TupleStoreError {
    /// The initial TCP connect (or handshake) failed.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// The server rejected the configured credentials.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The socket was closed or errored mid-session.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// No reply arrived within the configured request timeout.
    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// A malformed frame was received. Fatal to the connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A field value could not be coded for its declared type.
    #[error("value coding error: {0}")]
    Coding(String),

    /// A symbolic space, index, or field name could not be resolved.
    #[error("schema error: {0}")]
    Schema(String),

    /// Invalid client configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The pending-request table reached its configured cap.
    #[error("pending request limit reached ({0})")]
    PendingLimit(usize),

    /// A well-formed error reply from the server.
    #[error("server error ({code}): {message}")]
    Server {
        /// The server's error class.
        code: ServerErrorCode,
        /// The error message from the server.
        message: String,
    },

    /// I/O errors from the standard library (wrapped in `Arc` for `Clone`).
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for TupleStoreError {
    fn from(err: io::Error) -> Self {
        TupleStoreError::Io(Arc::new(err))
    }
}

impl TupleStoreError {
    /// Creates a `TupleStoreError::Server` from a raw response code and message.
    pub fn from_response(code: u32, message: String) -> Self {
        let code = ServerErrorCode::from_response_code(code)
            .unwrap_or(ServerErrorCode(0));
        Self::Server { code, message }
    }

    /// Returns the server error class if this is a server error.
    pub fn server_code(&self) -> Option<ServerErrorCode> {
        match self {
            Self::Server { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Returns `true` if this error reports a stale schema version.
    ///
    /// This is the single trigger for the client's schema cache
    /// invalidation and one-shot retry.
    pub fn is_schema_mismatch(&self) -> bool {
        matches!(self, Self::Server { code, .. } if code.is_schema_mismatch())
    }
}

/// A specialized `Result` type for tuplestore operations.
pub type Result<T> = std::result::Result<T, TupleStoreError>;

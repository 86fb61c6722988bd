//! Numeric constants of the binary protocol.

/// Header map key: request type (requests) or response code (replies).
pub const KEY_CODE: u64 = 0x00;

/// Header map key: per-connection request id, echoed in the reply.
pub const KEY_SYNC: u64 = 0x01;

/// Header map key: schema version the request was planned against.
pub const KEY_SCHEMA_VERSION: u64 = 0x05;

/// Body map key: numeric space id.
pub const KEY_SPACE_ID: u64 = 0x10;

/// Body map key: numeric index id.
pub const KEY_INDEX_ID: u64 = 0x11;

/// Body map key: select result limit.
pub const KEY_LIMIT: u64 = 0x12;

/// Body map key: select result offset.
pub const KEY_OFFSET: u64 = 0x13;

/// Body map key: select iterator code.
pub const KEY_ITERATOR: u64 = 0x14;

/// Body map key: key values.
pub const KEY_KEY: u64 = 0x20;

/// Body map key: tuple values (also carries auth credentials).
pub const KEY_TUPLE: u64 = 0x21;

/// Body map key: remote procedure name.
pub const KEY_FUNCTION_NAME: u64 = 0x22;

/// Body map key: user name for authentication.
pub const KEY_USER_NAME: u64 = 0x23;

/// Body map key: update operations list (upsert).
pub const KEY_OPS: u64 = 0x28;

/// Body map key: response payload, a list of tuples.
pub const KEY_DATA: u64 = 0x30;

/// Body map key: server error message.
pub const KEY_ERROR: u64 = 0x31;

/// Size of the fixed server greeting.
pub const GREETING_SIZE: usize = 128;

/// Offset of the salt line inside the greeting.
pub const GREETING_SALT_OFFSET: usize = 64;

/// Length of the base64-encoded salt inside the greeting.
pub const GREETING_SALT_B64_LEN: usize = 44;

/// Number of salt bytes consumed by the password scramble.
pub const SCRAMBLE_SIZE: usize = 20;

/// Authentication mechanism name sent in the auth request.
pub const AUTH_MECHANISM: &str = "chap-sha1";

/// Numeric id of the `_vspace` metadata space.
pub const VSPACE_ID: u32 = 281;

/// Numeric id of the `_vindex` metadata space.
pub const VINDEX_ID: u32 = 289;

/// Search direction and inclusivity for a select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum IteratorType {
    /// Exact key match.
    #[default]
    Eq = 0,
    /// Every tuple in index order.
    All = 2,
    /// Keys strictly less than the given key.
    Lt = 3,
    /// Keys less than or equal to the given key.
    Le = 4,
    /// Keys greater than or equal to the given key.
    Ge = 5,
    /// Keys strictly greater than the given key.
    Gt = 6,
}

impl IteratorType {
    /// Creates an iterator type from its wire code.
    pub fn from_value(value: u64) -> Option<Self> {
        match value {
            0 => Some(Self::Eq),
            2 => Some(Self::All),
            3 => Some(Self::Lt),
            4 => Some(Self::Le),
            5 => Some(Self::Ge),
            6 => Some(Self::Gt),
            _ => None,
        }
    }

    /// Returns the wire code of this iterator type.
    pub fn value(self) -> u64 {
        self as u64
    }
}

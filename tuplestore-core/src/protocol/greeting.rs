//! The fixed-size server greeting sent on connect.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use super::constants::{
    GREETING_SALT_B64_LEN, GREETING_SALT_OFFSET, GREETING_SIZE, SCRAMBLE_SIZE,
};
use super::request::protocol_error;
use crate::error::Result;

/// The parsed server greeting.
///
/// The greeting is exactly [`GREETING_SIZE`] bytes: a banner line with the
/// server version, then a line carrying the base64-encoded salt used for
/// password scrambling.
#[derive(Debug, Clone)]
pub struct Greeting {
    /// The server banner, e.g. `TupleStore 1.6.8 (Binary)`.
    pub banner: String,
    /// The decoded salt.
    pub salt: Vec<u8>,
}

impl Greeting {
    /// Parses a raw greeting buffer.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() != GREETING_SIZE {
            return Err(protocol_error(format!(
                "greeting must be {GREETING_SIZE} bytes, got {}",
                raw.len()
            )));
        }

        let banner_line = &raw[..GREETING_SALT_OFFSET];
        let banner = String::from_utf8_lossy(banner_line)
            .trim_end_matches(['\n', ' ', '\0'])
            .to_string();

        let salt_b64 = &raw[GREETING_SALT_OFFSET..GREETING_SALT_OFFSET + GREETING_SALT_B64_LEN];
        let salt = STANDARD
            .decode(salt_b64)
            .map_err(|e| protocol_error(format!("invalid greeting salt: {e}")))?;

        if salt.len() < SCRAMBLE_SIZE {
            return Err(protocol_error(format!(
                "greeting salt too short: {} bytes",
                salt.len()
            )));
        }

        Ok(Self { banner, salt })
    }
}

//! Response envelope and its wire decoding.

use bytes::{BufMut, BytesMut};
use rmpv::Value;

use super::constants::*;
use super::request::{map_array, map_get, map_u64, protocol_error, read_map, write_value};
use crate::error::{Result, ServerErrorCode, TupleStoreError};

/// A decoded response envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Response code: zero for success, otherwise the error bit plus the
    /// server's error class in the low bits.
    pub code: u32,
    /// Echo of the request's sync id.
    pub sync: u32,
    /// The server's current schema version, when reported.
    pub schema_version: Option<u64>,
    /// Server error message for non-zero codes.
    pub error: Option<String>,
    /// Payload tuples, when the operation returns data.
    pub data: Option<Vec<Value>>,
}

impl Response {
    /// Creates a success envelope carrying the given payload.
    pub fn ok(sync: u32, schema_version: Option<u64>, data: Option<Vec<Value>>) -> Self {
        Self {
            code: 0,
            sync,
            schema_version,
            error: None,
            data,
        }
    }

    /// Creates an error envelope for the given error class.
    pub fn server_error(
        sync: u32,
        schema_version: Option<u64>,
        code: ServerErrorCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code: code.response_code(),
            sync,
            schema_version,
            error: Some(message.into()),
            data: None,
        }
    }

    /// Returns `true` when the response reports success.
    pub fn is_ok(&self) -> bool {
        self.code == 0
    }

    /// Returns the server error class for a non-zero code.
    pub fn error_code(&self) -> Option<ServerErrorCode> {
        ServerErrorCode::from_response_code(self.code)
    }

    /// Converts an error response into a [`TupleStoreError::Server`].
    ///
    /// Returns `None` for success envelopes.
    pub fn to_error(&self) -> Option<TupleStoreError> {
        self.error_code().map(|code| TupleStoreError::Server {
            code,
            message: self.error.clone().unwrap_or_default(),
        })
    }

    /// Consumes the envelope, returning its payload tuples (empty when absent).
    pub fn into_data(self) -> Vec<Value> {
        self.data.unwrap_or_default()
    }

    /// Encodes this response as a complete frame (length prefix included).
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        let mut header = Vec::with_capacity(3);
        header.push((Value::from(KEY_CODE), Value::from(self.code)));
        header.push((Value::from(KEY_SYNC), Value::from(self.sync)));
        if let Some(version) = self.schema_version {
            header.push((Value::from(KEY_SCHEMA_VERSION), Value::from(version)));
        }

        let mut body = Vec::with_capacity(1);
        if let Some(message) = &self.error {
            body.push((Value::from(KEY_ERROR), Value::from(message.as_str())));
        }
        if let Some(data) = &self.data {
            body.push((Value::from(KEY_DATA), Value::Array(data.clone())));
        }

        let mut payload = Vec::with_capacity(64);
        write_value(&mut payload, &Value::Map(header))?;
        write_value(&mut payload, &Value::Map(body))?;

        let mut prefix = Vec::with_capacity(5);
        rmp::encode::write_u32(&mut prefix, payload.len() as u32)
            .map_err(|e| protocol_error(format!("failed to encode frame length: {e}")))?;

        dst.reserve(prefix.len() + payload.len());
        dst.put_slice(&prefix);
        dst.put_slice(&payload);
        Ok(())
    }

    /// Decodes a response from a frame payload (length prefix stripped).
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut rd = payload;
        let header = read_map(&mut rd, "response header")?;
        let body = if rd.is_empty() {
            Vec::new()
        } else {
            read_map(&mut rd, "response body")?
        };

        let code = map_u64(&header, KEY_CODE)
            .ok_or_else(|| protocol_error("missing response code"))? as u32;
        let sync = map_u64(&header, KEY_SYNC)
            .ok_or_else(|| protocol_error("missing response sync"))? as u32;

        let error = match map_get(&body, KEY_ERROR) {
            Some(Value::String(s)) => s.as_str().map(str::to_owned),
            _ => None,
        };

        Ok(Self {
            code,
            sync,
            schema_version: map_u64(&header, KEY_SCHEMA_VERSION),
            error,
            data: map_array(&body, KEY_DATA),
        })
    }
}

//! Codec for encoding requests and decoding responses on the wire.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::request::{protocol_error, Request};
use super::response::Response;
use crate::error::{Result, TupleStoreError};

/// Parses the MessagePack unsigned-int length prefix at the start of `src`.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the prefix
/// length and the frame payload length. Any non-uint marker is a protocol
/// error: the stream cannot be resynchronized after it.
pub fn decode_frame_length(src: &[u8]) -> Result<Option<(usize, usize)>> {
    let Some(&marker) = src.first() else {
        return Ok(None);
    };

    let (prefix_len, payload_len) = match marker {
        0x00..=0x7f => (1, u64::from(marker)),
        0xcc => {
            if src.len() < 2 {
                return Ok(None);
            }
            (2, u64::from(src[1]))
        }
        0xcd => {
            if src.len() < 3 {
                return Ok(None);
            }
            (3, u64::from(u16::from_be_bytes([src[1], src[2]])))
        }
        0xce => {
            if src.len() < 5 {
                return Ok(None);
            }
            (5, u64::from(u32::from_be_bytes([src[1], src[2], src[3], src[4]])))
        }
        0xcf => {
            if src.len() < 9 {
                return Ok(None);
            }
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&src[1..9]);
            (9, u64::from_be_bytes(bytes))
        }
        other => {
            return Err(protocol_error(format!(
                "invalid frame length marker 0x{other:02x}"
            )))
        }
    };

    Ok(Some((prefix_len, payload_len as usize)))
}

/// Codec pairing [`Request`] encoding with [`Response`] decoding.
///
/// Implements the `tokio_util::codec` traits so the connection can drive
/// framed reads and writes over a `BytesMut` buffer. Partial frames are
/// left in the buffer until complete.
#[derive(Debug, Default)]
pub struct ClientCodec;

impl ClientCodec {
    /// Creates a new codec instance.
    pub fn new() -> Self {
        Self
    }
}

impl Encoder<Request> for ClientCodec {
    type Error = TupleStoreError;

    fn encode(&mut self, item: Request, dst: &mut BytesMut) -> Result<()> {
        item.encode(dst)
    }
}

impl Decoder for ClientCodec {
    type Item = Response;
    type Error = TupleStoreError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let Some((prefix_len, payload_len)) = decode_frame_length(src)? else {
            return Ok(None);
        };

        if src.len() < prefix_len + payload_len {
            src.reserve(prefix_len + payload_len - src.len());
            return Ok(None);
        }

        src.advance(prefix_len);
        let payload = src.split_to(payload_len);
        Response::decode(&payload).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::request::RequestBody;
    use rmpv::Value;

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut codec = ClientCodec::new();
        let mut buf = BytesMut::new();

        let request = Request::new(1, None, RequestBody::Ping);
        codec.encode(request, &mut buf).unwrap();
        assert!(!buf.is_empty());

        // A response frame is decodable from the same framing.
        let mut wire = BytesMut::new();
        Response::ok(1, Some(2), None).encode(&mut wire).unwrap();
        let decoded = codec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(decoded.sync, 1);
        assert_eq!(decoded.schema_version, Some(2));
        assert!(wire.is_empty());
    }

    #[test]
    fn test_decode_incomplete_prefix() {
        let mut codec = ClientCodec::new();
        let mut buf = BytesMut::from(&[0xce, 0x00][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_decode_incomplete_payload() {
        let mut full = BytesMut::new();
        Response::ok(9, None, None).encode(&mut full).unwrap();

        let split_point = full.len() / 2;
        let mut partial = full.split_to(split_point);

        let mut codec = ClientCodec::new();
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.unsplit(full);
        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded.sync, 9);
    }

    #[test]
    fn test_decode_multiple_frames() {
        let mut wire = BytesMut::new();
        Response::ok(1, None, None).encode(&mut wire).unwrap();
        Response::ok(2, None, Some(vec![Value::from("row")]))
            .encode(&mut wire)
            .unwrap();

        let mut codec = ClientCodec::new();
        let first = codec.decode(&mut wire).unwrap().unwrap();
        let second = codec.decode(&mut wire).unwrap().unwrap();

        assert_eq!(first.sync, 1);
        assert_eq!(second.sync, 2);
        assert_eq!(second.data, Some(vec![Value::from("row")]));
        assert!(wire.is_empty());
    }

    #[test]
    fn test_invalid_length_marker_is_fatal() {
        let mut codec = ClientCodec::new();
        // 0xc1 is never a valid MessagePack marker.
        let mut buf = BytesMut::from(&[0xc1, 0x00, 0x00][..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, TupleStoreError::Protocol(_)));
    }

    #[test]
    fn test_decode_frame_length_markers() {
        assert_eq!(decode_frame_length(&[0x05]).unwrap(), Some((1, 5)));
        assert_eq!(decode_frame_length(&[0xcc, 0xff]).unwrap(), Some((2, 255)));
        assert_eq!(
            decode_frame_length(&[0xcd, 0x01, 0x00]).unwrap(),
            Some((3, 256))
        );
        assert_eq!(
            decode_frame_length(&[0xce, 0x00, 0x00, 0x01, 0x00]).unwrap(),
            Some((5, 256))
        );
        assert_eq!(decode_frame_length(&[]).unwrap(), None);
    }

    #[test]
    fn test_codec_is_reusable() {
        let mut codec = ClientCodec::new();
        for sync in 0..10u32 {
            let mut wire = BytesMut::new();
            Response::ok(sync, None, None).encode(&mut wire).unwrap();
            let decoded = codec.decode(&mut wire).unwrap().unwrap();
            assert_eq!(decoded.sync, sync);
        }
    }
}

//! The outer message envelope.
//!
//! Every frame decodes into `{ payload_type, payload, client_msg_id? }`.
//! Unknown payload types decode successfully with the tag preserved so the
//! dispatcher can still route them; only structurally malformed bytes raise
//! a decode error.

use bytes::Bytes;
use prost::Message;

use crate::error::Result;

/// The framed protobuf envelope.
#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    /// Numeric tag identifying the payload body
    #[prost(uint32, tag = "1")]
    pub payload_type: u32,
    /// Opaque serialized payload
    #[prost(bytes = "bytes", tag = "2")]
    pub payload: Bytes,
    /// Correlation token echoed by the server on the matching response
    #[prost(string, optional, tag = "3")]
    pub client_msg_id: Option<String>,
}

impl Envelope {
    pub fn new(payload_type: u32, payload: Bytes) -> Self {
        Self {
            payload_type,
            payload,
            client_msg_id: None,
        }
    }

    pub fn with_correlation(payload_type: u32, payload: Bytes, client_msg_id: String) -> Self {
        Self {
            payload_type,
            payload,
            client_msg_id: Some(client_msg_id),
        }
    }
}

/// Serializes an envelope into the bytes that go inside a frame.
pub fn encode(envelope: &Envelope) -> Bytes {
    let mut buf = Vec::with_capacity(envelope.encoded_len());
    envelope
        .encode(&mut buf)
        .expect("Vec<u8> writes are infallible");
    Bytes::from(buf)
}

/// Parses the bytes of one frame into an envelope.
pub fn decode(bytes: &[u8]) -> Result<Envelope> {
    Ok(Envelope::decode(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let envelope = Envelope::with_correlation(
            2100,
            Bytes::from_static(b"\x01\x02\x03"),
            "abc".to_string(),
        );
        let decoded = decode(&encode(&envelope)).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_roundtrip_without_correlation() {
        let envelope = Envelope::new(51, Bytes::new());
        let decoded = decode(&encode(&envelope)).unwrap();
        assert_eq!(decoded, envelope);
        assert!(decoded.client_msg_id.is_none());
    }

    #[test]
    fn test_unknown_payload_type_is_preserved() {
        let envelope = Envelope::new(999_999, Bytes::from_static(b"opaque"));
        let decoded = decode(&encode(&envelope)).unwrap();
        assert_eq!(decoded.payload_type, 999_999);
        assert_eq!(&decoded.payload[..], b"opaque");
    }

    #[test]
    fn test_malformed_bytes_fail() {
        // A field header promising more bytes than exist
        assert!(decode(&[0x0a, 0xff]).is_err());
    }
}

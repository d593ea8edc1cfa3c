//! Length-prefixed framing.
//!
//! The wire format is a 4-byte big-endian length followed by that many bytes
//! of serialized envelope. Frames above the configured limit are a protocol
//! error that tears down the connection, in both directions.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::CTraderError;

const LENGTH_PREFIX_BYTES: usize = 4;

/// Codec for the 4-byte big-endian length-prefixed frames used by the
/// protobuf endpoint.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_bytes: usize,
    // Pending payload length once the prefix has been consumed
    len: Option<usize>,
}

impl FrameCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            len: None,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = CTraderError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let len = match self.len {
            Some(len) => len,
            None => {
                if src.len() < LENGTH_PREFIX_BYTES {
                    return Ok(None);
                }
                let len = src.get_u32() as usize;
                if len == 0 {
                    return Err(CTraderError::Protocol(
                        "zero-length frame".to_string(),
                    ));
                }
                if len > self.max_frame_bytes {
                    return Err(CTraderError::FrameTooLarge {
                        len,
                        max: self.max_frame_bytes,
                    });
                }
                src.reserve(len);
                self.len = Some(len);
                len
            }
        };

        if src.len() < len {
            return Ok(None);
        }
        self.len = None;
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = CTraderError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.max_frame_bytes {
            return Err(CTraderError::FrameTooLarge {
                len: item.len(),
                max: self.max_frame_bytes,
            });
        }
        dst.reserve(LENGTH_PREFIX_BYTES + item.len());
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let mut codec = FrameCodec::new(1024);
        let mut buf = BytesMut::new();
        codec
            .encode(Bytes::from_static(b"hello"), &mut buf)
            .unwrap();
        assert_eq!(&buf[..4], &[0, 0, 0, 5]);

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_partial_frame() {
        let mut codec = FrameCodec::new(1024);
        let mut buf = BytesMut::new();

        // Length prefix only
        buf.put_u32(10);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        // Half the payload
        buf.extend_from_slice(&[1u8; 5]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        // The rest
        buf.extend_from_slice(&[2u8; 5]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.len(), 10);
    }

    #[test]
    fn test_decode_back_to_back_frames() {
        let mut codec = FrameCodec::new(1024);
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"one"), &mut buf).unwrap();
        codec.encode(Bytes::from_static(b"four"), &mut buf).unwrap();

        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"one");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"four");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_rejects_oversized_frame() {
        let mut codec = FrameCodec::new(8);
        let mut buf = BytesMut::new();
        buf.put_u32(9);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            CTraderError::FrameTooLarge { len: 9, max: 8 }
        ));
    }

    #[test]
    fn test_decode_rejects_zero_length() {
        let mut codec = FrameCodec::new(8);
        let mut buf = BytesMut::new();
        buf.put_u32(0);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CTraderError::Protocol(_))
        ));
    }

    #[test]
    fn test_encode_rejects_oversized_frame() {
        let mut codec = FrameCodec::new(4);
        let mut buf = BytesMut::new();
        let err = codec
            .encode(Bytes::from_static(b"12345"), &mut buf)
            .unwrap_err();
        assert!(matches!(err, CTraderError::FrameTooLarge { .. }));
        assert!(buf.is_empty());
    }
}

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Result, TransportError};

/// Message header: magic (2) + length (4) = 6 bytes.
pub const HEADER_SIZE: usize = 6;

/// Magic bytes: "EW" (0x45 0x57).
pub const MAGIC: [u8; 2] = [0x45, 0x57];

/// Default maximum message size: 16 MiB.
pub const DEFAULT_MAX_MESSAGE: usize = 16 * 1024 * 1024;

/// Limits for stream transports.
#[derive(Debug, Clone)]
pub struct MessageConfig {
    /// Maximum message size in bytes. Default: 16 MiB.
    pub max_message_size: usize,
}

impl Default for MessageConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE,
        }
    }
}

/// Length-prefixed message codec for byte streams.
///
/// Wire format:
/// ```text
/// ┌──────────────┬───────────┬──────────────────┐
/// │ Magic (2B)   │ Length    │ Message          │
/// │ 0x45 0x57    │ (4B LE)   │ (Length bytes)   │
/// │ "EW"         │           │                  │
/// └──────────────┴───────────┴──────────────────┘
/// ```
#[derive(Debug, Clone)]
pub struct MessageCodec {
    max_message_size: usize,
}

impl MessageCodec {
    pub fn new(config: &MessageConfig) -> Self {
        Self {
            max_message_size: config.max_message_size,
        }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(&MessageConfig::default())
    }
}

impl Decoder for MessageCodec {
    type Item = Bytes;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        if src[0..2] != MAGIC {
            return Err(TransportError::InvalidMagic);
        }

        let len = u32::from_le_bytes([src[2], src[3], src[4], src[5]]) as usize;
        if len > self.max_message_size {
            return Err(TransportError::MessageTooLarge {
                size: len,
                max: self.max_message_size,
            });
        }

        let total = HEADER_SIZE + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Bytes> for MessageCodec {
    type Error = TransportError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        if item.len() > self.max_message_size || item.len() > u32::MAX as usize {
            return Err(TransportError::MessageTooLarge {
                size: item.len(),
                max: self.max_message_size.min(u32::MAX as usize),
            });
        }
        dst.reserve(HEADER_SIZE + item.len());
        dst.put_slice(&MAGIC);
        dst.put_u32_le(item.len() as u32);
        dst.put_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode() {
        let mut codec = MessageCodec::default();
        let mut buf = BytesMut::new();
        codec
            .encode(Bytes::from_static(b"frame-bytes"), &mut buf)
            .unwrap();
        assert_eq!(buf.len(), HEADER_SIZE + 11);
        assert_eq!(&buf[0..2], b"EW");

        let message = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(message, "frame-bytes");
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_input_waits_for_more() {
        let mut codec = MessageCodec::default();
        let mut full = BytesMut::new();
        codec.encode(Bytes::from_static(b"hello"), &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        let mut partial = BytesMut::from(&full[..HEADER_SIZE + 2]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn back_to_back_messages() {
        let mut codec = MessageCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"first"), &mut buf).unwrap();
        codec.encode(Bytes::new(), &mut buf).unwrap();
        codec.encode(Bytes::from_static(b"third"), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "first");
        assert!(codec.decode(&mut buf).unwrap().unwrap().is_empty());
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "third");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut codec = MessageCodec::default();
        let mut buf = BytesMut::from(&[0x49, 0x50, 0, 0, 0, 0][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(TransportError::InvalidMagic)
        ));
    }

    #[test]
    fn enforces_size_limit() {
        let mut codec = MessageCodec::new(&MessageConfig {
            max_message_size: 4,
        });
        let mut buf = BytesMut::new();
        assert!(matches!(
            codec.encode(Bytes::from_static(b"too long"), &mut buf),
            Err(TransportError::MessageTooLarge { size: 8, max: 4 })
        ));

        buf.put_slice(&MAGIC);
        buf.put_u32_le(1024);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(TransportError::MessageTooLarge { size: 1024, max: 4 })
        ));
    }
}

use bytes::{BufMut, BytesMut};
use eventwire_codec::Codec;
use tracing::trace;

use crate::error::{ProtocolError, Result};
use crate::frame::Frame;
use crate::kind::PacketKind;
use crate::varint::{get_varint, put_varint, varint_len};

/// Default maximum encoded payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Default maximum size of a whole encoded frame: 16 MiB, the stream
/// transports' default message limit.
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

/// Default maximum channel name length in bytes.
pub const DEFAULT_MAX_CHANNEL_LEN: usize = 255;

/// Limits applied by the frame envelope.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum channel name length in bytes. Default: 255.
    pub max_channel_len: usize,
    /// Maximum codec payload size in bytes. Default: 16 MiB.
    pub max_payload_size: usize,
    /// Maximum size of the whole encoded frame, header included. Keep it at
    /// or below the transport's message limit. Default: 16 MiB.
    pub max_frame_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_channel_len: DEFAULT_MAX_CHANNEL_LEN,
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            max_frame_size: DEFAULT_MAX_FRAME,
        }
    }
}

/// Encode a frame into its wire form.
///
/// Wire format:
/// ```text
/// ┌──────────┬─────────────┬──────────┬──────────┬────────────────┬──────────────┐
/// │ Kind (1) │ ChanLen     │ Channel  │ HasCorr  │ CorrelationId  │ Payload      │
/// │          │ (varint)    │ (utf-8)  │ (1)      │ (varint, opt.) │ (codec bytes)│
/// └──────────┴─────────────┴──────────┴──────────┴────────────────┴──────────────┘
/// ```
pub fn encode_frame(
    frame: &Frame,
    codec: &dyn Codec,
    config: &FrameConfig,
    dst: &mut BytesMut,
) -> Result<()> {
    frame.validate()?;
    let channel = frame.channel().as_bytes();
    if channel.len() > config.max_channel_len {
        return Err(ProtocolError::ChannelTooLong {
            len: channel.len(),
            max: config.max_channel_len,
        });
    }

    let payload = codec.encode(frame.payload())?;
    if payload.len() > config.max_payload_size {
        return Err(ProtocolError::PayloadTooLarge {
            size: payload.len(),
            max: config.max_payload_size,
        });
    }

    let correlation_len = frame.correlation_id().map_or(0, varint_len);
    let size = 1 + varint_len(channel.len() as u64) + channel.len() + 1 + correlation_len + payload.len();
    if size > config.max_frame_size {
        return Err(ProtocolError::FrameTooLarge {
            size,
            max: config.max_frame_size,
        });
    }

    dst.reserve(size);
    dst.put_u8(frame.kind().as_u8());
    put_varint(channel.len() as u64, dst);
    dst.put_slice(channel);
    match frame.correlation_id() {
        Some(id) => {
            dst.put_u8(1);
            put_varint(id, dst);
        }
        None => dst.put_u8(0),
    }
    dst.put_slice(&payload);
    Ok(())
}

/// Decode one complete frame.
///
/// The transport delimits messages, so `src` holds exactly one frame.
pub fn decode_frame(src: &[u8], codec: &dyn Codec, config: &FrameConfig) -> Result<Frame> {
    if src.len() > config.max_frame_size {
        return Err(ProtocolError::FrameTooLarge {
            size: src.len(),
            max: config.max_frame_size,
        });
    }
    let mut rest = src;

    let (&kind_byte, tail) = rest.split_first().ok_or(ProtocolError::Truncated("packet kind"))?;
    rest = tail;
    let kind = PacketKind::from_u8(kind_byte).ok_or(ProtocolError::UnknownKind(kind_byte))?;

    let channel_len = get_varint(&mut rest, "channel length")?;
    let channel_len = usize::try_from(channel_len)
        .ok()
        .filter(|len| *len <= config.max_channel_len)
        .ok_or(ProtocolError::ChannelTooLong {
            len: usize::try_from(channel_len).unwrap_or(usize::MAX),
            max: config.max_channel_len,
        })?;
    if channel_len == 0 {
        return Err(ProtocolError::MissingChannel);
    }
    if rest.len() < channel_len {
        return Err(ProtocolError::Truncated("channel"));
    }
    let (channel, tail) = rest.split_at(channel_len);
    rest = tail;
    let channel = std::str::from_utf8(channel).map_err(|_| ProtocolError::InvalidChannel)?;

    let (&flag, tail) = rest
        .split_first()
        .ok_or(ProtocolError::Truncated("correlation flag"))?;
    rest = tail;
    let correlation_id = match flag {
        0 => None,
        1 => Some(get_varint(&mut rest, "correlation id")?),
        other => return Err(ProtocolError::InvalidFlag(other)),
    };

    if rest.len() > config.max_payload_size {
        return Err(ProtocolError::PayloadTooLarge {
            size: rest.len(),
            max: config.max_payload_size,
        });
    }
    // Check the correlation invariant before paying for the payload decode.
    match (kind.requires_correlation(), correlation_id) {
        (true, None) => return Err(ProtocolError::MissingCorrelation(kind)),
        (false, Some(_)) => return Err(ProtocolError::UnexpectedCorrelation(kind)),
        _ => {}
    }
    if rest.is_empty() {
        return Err(ProtocolError::Truncated("payload"));
    }

    let payload = codec.decode(rest)?;
    let frame = Frame::new(kind, channel, correlation_id, payload)?;
    trace!(kind = %frame.kind(), channel = frame.channel(), size = src.len(), "decoded frame");
    Ok(frame)
}

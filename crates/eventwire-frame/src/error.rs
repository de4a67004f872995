use eventwire_codec::CodecError;

use crate::kind::PacketKind;

/// Errors raised while validating, encoding or decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The packet kind byte is not a known kind.
    #[error("unknown packet kind {0:#04x}")]
    UnknownKind(u8),

    /// The frame ended before the named field was complete.
    #[error("truncated frame: missing {0}")]
    Truncated(&'static str),

    /// A varint ran past 64 bits.
    #[error("varint overflows u64")]
    VarintOverflow,

    /// The correlation flag byte is neither 0 nor 1.
    #[error("invalid correlation flag {0:#04x}")]
    InvalidFlag(u8),

    /// The channel name is empty.
    #[error("missing channel")]
    MissingChannel,

    /// The channel name is not valid UTF-8.
    #[error("channel name is not valid utf-8")]
    InvalidChannel,

    /// The channel name exceeds the configured maximum.
    #[error("channel name too long ({len} bytes, max {max})")]
    ChannelTooLong { len: usize, max: usize },

    /// A correlation id was attached to a kind that forbids it.
    #[error("{0} frames must not carry a correlation id")]
    UnexpectedCorrelation(PacketKind),

    /// An ack kind arrived without its correlation id.
    #[error("{0} frames require a correlation id")]
    MissingCorrelation(PacketKind),

    /// An EVENT or ACK_REQUEST payload does not start with an event name.
    #[error("{0} payload must start with a non-empty event name")]
    MissingEventName(PacketKind),

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The encoded frame exceeds the configured maximum size.
    #[error("frame too large ({size} bytes, max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// The codec rejected the payload.
    #[error("payload codec error: {0}")]
    Codec(#[from] CodecError),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

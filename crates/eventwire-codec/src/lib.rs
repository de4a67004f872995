//! Payload codecs for eventwire.
//!
//! A codec turns an ordered sequence of [`Value`]s into bytes and back. The
//! protocol layers above never look at the encoded form, so a connection can
//! switch between the self-describing JSON codec and the compact MessagePack
//! codec without any other change.

pub mod error;
pub mod json;
#[cfg(feature = "msgpack")]
pub mod msgpack;
pub mod value;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub use error::{CodecError, Result};
pub use json::JsonCodec;
#[cfg(feature = "msgpack")]
pub use msgpack::MsgPackCodec;
pub use value::Value;

/// Encodes and decodes a frame payload.
///
/// Implementations must be pure: `decode(encode(v)) == v` for every value
/// sequence the codec accepts.
pub trait Codec: Send + Sync + fmt::Debug {
    /// Short stable name used in logs and diagnostics.
    fn name(&self) -> &'static str;

    /// Encode a value sequence.
    fn encode(&self, values: &[Value]) -> Result<Vec<u8>>;

    /// Decode a value sequence. Truncated or structurally invalid input is a
    /// [`CodecError::Decode`].
    fn decode(&self, bytes: &[u8]) -> Result<Vec<Value>>;
}

/// Built-in codec selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecKind {
    #[default]
    Json,
    #[cfg(feature = "msgpack")]
    MsgPack,
}

impl CodecKind {
    /// Instantiate the selected codec.
    pub fn build(self) -> Arc<dyn Codec> {
        match self {
            CodecKind::Json => Arc::new(JsonCodec),
            #[cfg(feature = "msgpack")]
            CodecKind::MsgPack => Arc::new(MsgPackCodec),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CodecKind::Json => "json",
            #[cfg(feature = "msgpack")]
            CodecKind::MsgPack => "msgpack",
        }
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CodecKind {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(CodecKind::Json),
            #[cfg(feature = "msgpack")]
            "msgpack" | "messagepack" => Ok(CodecKind::MsgPack),
            other => Err(CodecError::UnknownCodec(other.to_string())),
        }
    }
}

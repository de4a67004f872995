//! Channel-tagged frames for eventwire.
//!
//! Every protocol message is one frame:
//! - a 1-byte packet kind
//! - a varint-prefixed channel name (the namespace, `"/"` by default)
//! - a correlation flag and, for ack kinds, a varint correlation id
//! - the codec-encoded payload
//!
//! Frames are validated on both encode and decode, so a malformed frame never
//! reaches the dispatcher.

pub mod error;
pub mod frame;
pub mod kind;
pub mod varint;
pub mod wire;

pub use error::{ProtocolError, Result};
pub use frame::{Frame, DEFAULT_CHANNEL};
pub use kind::PacketKind;
pub use wire::{decode_frame, encode_frame, FrameConfig, DEFAULT_MAX_CHANNEL_LEN, DEFAULT_MAX_FRAME, DEFAULT_MAX_PAYLOAD};

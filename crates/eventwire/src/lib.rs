//! Event multiplexing over a single connection.
//!
//! eventwire lets two peers exchange named events on independent channels
//! (namespaces) over one transport link, with request/acknowledgement
//! correlation, a pluggable payload codec and automatic reconnection.
//!
//! # Crate Structure
//!
//! - [`transport`]: the message transport boundary (in-memory, TCP, UDS)
//! - [`codec`]: payload values and the JSON / MessagePack codecs
//! - [`frame`]: channel-tagged packet framing
//! - [`session`]: sockets, channels, acks, dispatch and reconnection (behind
//!   the `session` feature)

/// Re-export transport types.
pub mod transport {
    pub use eventwire_transport::*;
}

/// Re-export codec types.
pub mod codec {
    pub use eventwire_codec::*;
}

/// Re-export frame types.
pub mod frame {
    pub use eventwire_frame::*;
}

/// Re-export session types (requires `session` feature).
#[cfg(feature = "session")]
pub mod session {
    pub use eventwire_session::*;
}

#[cfg(feature = "session")]
pub use eventwire_session::{
    connect, ChannelHandle, ClientConfig, LifecycleEvent, ReconnectPolicy, Server, ServerConfig,
    SessionError, Socket, Value,
};

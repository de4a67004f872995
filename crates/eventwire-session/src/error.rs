use std::time::Duration;

/// Errors surfaced by sessions, channels and pending calls.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// A frame failed validation or decoding.
    #[error("protocol error: {0}")]
    Protocol(#[from] eventwire_frame::ProtocolError),

    /// A payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] eventwire_codec::CodecError),

    /// The underlying transport failed.
    #[error("transport error: {0}")]
    Transport(#[from] eventwire_transport::TransportError),

    /// The channel (or the whole connection) is closed.
    #[error("channel {0} is closed")]
    ChannelClosed(String),

    /// The channel has not been joined yet and frames cannot be queued for it.
    #[error("channel {0} is not open")]
    ChannelNotOpen(String),

    /// The channel name is empty or too long.
    #[error("invalid channel name '{0}'")]
    InvalidChannel(String),

    /// No reply arrived before the deadline.
    #[error("ack {id} timed out after {timeout:?}")]
    AckTimeout { id: u64, timeout: Duration },

    /// The caller cancelled the call.
    #[error("call {0} was cancelled")]
    Cancelled(u64),

    /// The connection instance carrying the request was lost.
    #[error("connection lost before ack {0} was answered")]
    Disconnected(u64),

    /// Opening the transport failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The CONNECT / CONNECT_OK exchange failed or was rejected.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A connect or handshake step timed out.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The outbound queue is full.
    #[error("outbound queue full ({capacity} frames)")]
    QueueFull { capacity: usize },

    /// A call was made outside a Tokio runtime, so its deadline cannot run.
    #[error("no tokio runtime to time the call")]
    NoRuntime,

    /// Rooms exist only on server-side sockets.
    #[error("rooms are only available on server sockets")]
    ServerOnly,

    /// Too many calls are awaiting replies.
    #[error("too many pending acks (max {max})")]
    TooManyPending { max: usize },
}

pub type Result<T> = std::result::Result<T, SessionError>;

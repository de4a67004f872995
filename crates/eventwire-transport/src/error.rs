use std::path::PathBuf;

/// Errors that can occur in transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind to the specified endpoint.
    #[error("failed to bind to {endpoint}: {source}")]
    Bind {
        endpoint: String,
        source: std::io::Error,
    },

    /// Failed to connect to the specified endpoint.
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on an established stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The socket path is too long for the platform.
    #[error("socket path too long ({len} bytes, max {max}): {path}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },

    /// The endpoint string could not be parsed.
    #[error("invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    /// A stream message header did not start with the expected magic.
    #[error("invalid message magic (expected 0x4557 \"EW\")")]
    InvalidMagic,

    /// A message exceeds the configured maximum size.
    #[error("message too large ({size} bytes, max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// The remote side refused the connection.
    #[error("connection refused")]
    Refused,

    /// The link is closed; nothing more can be sent.
    #[error("transport closed")]
    Closed,

    /// The acceptor has been shut down.
    #[error("transport shut down")]
    Shutdown,
}

impl TransportError {
    /// Whether the error concerns a single message and leaves the link usable.
    pub fn is_message_error(&self) -> bool {
        matches!(self, TransportError::MessageTooLarge { .. })
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

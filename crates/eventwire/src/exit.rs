use std::fmt;
use std::io;

use eventwire_codec::CodecError;
use eventwire_frame::ProtocolError;
use eventwire_session::SessionError;
use eventwire_transport::TransportError;

// Process exit codes.
pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => FAILURE,
        io::ErrorKind::AddrInUse => TRANSPORT_ERROR,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Bind { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Accept(source)
        | TransportError::Io(source) => io_error(context, source),
        TransportError::InvalidEndpoint(_) => CliError::new(USAGE, format!("{context}: {err}")),
        TransportError::MessageTooLarge { .. } => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        TransportError::Refused => CliError::new(FAILURE, format!("{context}: {err}")),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn codec_error(context: &str, err: CodecError) -> CliError {
    match err {
        CodecError::UnknownCodec(_) => CliError::new(USAGE, format!("{context}: {err}")),
        other => CliError::new(DATA_INVALID, format!("{context}: {other}")),
    }
}

pub fn protocol_error(context: &str, err: ProtocolError) -> CliError {
    match err {
        ProtocolError::Codec(err) => codec_error(context, err),
        other => CliError::new(DATA_INVALID, format!("{context}: {other}")),
    }
}

pub fn session_error(context: &str, err: SessionError) -> CliError {
    match err {
        SessionError::Transport(err) => transport_error(context, err),
        SessionError::Codec(err) => codec_error(context, err),
        SessionError::Protocol(err) => protocol_error(context, err),
        SessionError::AckTimeout { .. } | SessionError::Timeout(_) => {
            CliError::new(TIMEOUT, format!("{context}: {err}"))
        }
        SessionError::InvalidChannel(_) => CliError::new(USAGE, format!("{context}: {err}")),
        SessionError::Handshake(_) => CliError::new(PERMISSION_DENIED, format!("{context}: {err}")),
        SessionError::ChannelClosed(_)
        | SessionError::ChannelNotOpen(_)
        | SessionError::Disconnected(_)
        | SessionError::Cancelled(_)
        | SessionError::Connect(_) => CliError::new(FAILURE, format!("{context}: {err}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

use std::fmt;
use std::time::Duration;

/// Connection state. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a connection instance ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `close()` was called on this side.
    LocalClose,
    /// The peer sent DISCONNECT on the default channel.
    RemoteClose,
    /// The transport reported end of stream.
    TransportClose,
    TransportError(String),
    /// Nothing arrived within the liveness window.
    PingTimeout,
    /// A malformed frame arrived in strict mode.
    ProtocolError(String),
}

impl DisconnectReason {
    /// Whether a client should try to reconnect after this reason.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            DisconnectReason::LocalClose | DisconnectReason::RemoteClose
        )
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::LocalClose => f.write_str("local close"),
            DisconnectReason::RemoteClose => f.write_str("remote close"),
            DisconnectReason::TransportClose => f.write_str("transport close"),
            DisconnectReason::TransportError(msg) => write!(f, "transport error: {msg}"),
            DisconnectReason::PingTimeout => f.write_str("ping timeout"),
            DisconnectReason::ProtocolError(msg) => write!(f, "protocol error: {msg}"),
        }
    }
}

/// Lifecycle notifications broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// A connection instance completed its handshake.
    Connect { sid: String },
    Disconnect { reason: DisconnectReason },
    /// A connect or handshake attempt failed.
    ConnectError { message: String },
    /// Attempt `attempt` (1-based) is scheduled after `delay`.
    ReconnectAttempt { attempt: u32, delay: Duration },
    /// Reconnected after `attempt` scheduled attempts.
    Reconnect { attempt: u32 },
    /// The retry budget ran out; the connection is closed.
    ReconnectFailed { attempts: u32 },
    ChannelConnect { channel: String },
    ChannelDisconnect { channel: String },
    /// The peer rejected or errored a channel.
    ChannelError { channel: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_explicit_closes_are_final() {
        assert!(!DisconnectReason::LocalClose.is_recoverable());
        assert!(!DisconnectReason::RemoteClose.is_recoverable());
        assert!(DisconnectReason::TransportClose.is_recoverable());
        assert!(DisconnectReason::PingTimeout.is_recoverable());
        assert!(DisconnectReason::TransportError("reset".into()).is_recoverable());
    }

    #[test]
    fn display_names() {
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
        assert_eq!(
            DisconnectReason::ProtocolError("bad kind".into()).to_string(),
            "protocol error: bad kind"
        );
    }
}

use std::fmt;

/// Packet kind, the first byte of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    /// Opens the connection (on `"/"`) or joins a channel.
    Connect = 0,
    /// Accepts a CONNECT.
    ConnectOk = 1,
    /// Fire-and-forget event.
    Event = 2,
    /// Event that expects an ACK_REPLY with the same correlation id.
    AckRequest = 3,
    /// Reply to an ACK_REQUEST.
    AckReply = 4,
    /// Leaves a channel, or closes the connection when sent on `"/"`.
    Disconnect = 5,
    /// Rejects a CONNECT or reports a channel-level failure.
    Error = 6,
    /// Liveness probe.
    Ping = 7,
    /// Liveness answer.
    Pong = 8,
}

impl PacketKind {
    pub const ALL: [PacketKind; 9] = [
        PacketKind::Connect,
        PacketKind::ConnectOk,
        PacketKind::Event,
        PacketKind::AckRequest,
        PacketKind::AckReply,
        PacketKind::Disconnect,
        PacketKind::Error,
        PacketKind::Ping,
        PacketKind::Pong,
    ];

    pub fn from_u8(byte: u8) -> Option<Self> {
        Self::ALL.get(usize::from(byte)).copied()
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether frames of this kind carry a correlation id. Presence is
    /// mandatory for these kinds and forbidden for the rest.
    pub fn requires_correlation(self) -> bool {
        matches!(self, PacketKind::AckRequest | PacketKind::AckReply)
    }

    /// Whether the payload starts with an event name.
    pub fn carries_event_name(self) -> bool {
        matches!(self, PacketKind::Event | PacketKind::AckRequest)
    }

    pub fn name(self) -> &'static str {
        match self {
            PacketKind::Connect => "CONNECT",
            PacketKind::ConnectOk => "CONNECT_OK",
            PacketKind::Event => "EVENT",
            PacketKind::AckRequest => "ACK_REQUEST",
            PacketKind::AckReply => "ACK_REPLY",
            PacketKind::Disconnect => "DISCONNECT",
            PacketKind::Error => "ERROR",
            PacketKind::Ping => "PING",
            PacketKind::Pong => "PONG",
        }
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

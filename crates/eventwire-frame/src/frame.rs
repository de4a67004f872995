use eventwire_codec::Value;

use crate::error::{ProtocolError, Result};
use crate::kind::PacketKind;

/// The default channel every connection starts with.
pub const DEFAULT_CHANNEL: &str = "/";

/// One protocol message.
///
/// Frames are immutable: construct one, encode it, send it. The correlation
/// id is present exactly when the kind is ACK_REQUEST or ACK_REPLY; the typed
/// constructors uphold this and [`Frame::new`] checks it.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    kind: PacketKind,
    channel: String,
    correlation_id: Option<u64>,
    payload: Vec<Value>,
}

impl Frame {
    /// Build a frame from raw parts, checking the kind invariants.
    pub fn new(
        kind: PacketKind,
        channel: impl Into<String>,
        correlation_id: Option<u64>,
        payload: Vec<Value>,
    ) -> Result<Self> {
        let frame = Self {
            kind,
            channel: channel.into(),
            correlation_id,
            payload,
        };
        frame.validate()?;
        Ok(frame)
    }

    pub fn connect(channel: impl Into<String>, payload: Vec<Value>) -> Self {
        Self::unchecked(PacketKind::Connect, channel, None, payload)
    }

    pub fn connect_ok(channel: impl Into<String>, payload: Vec<Value>) -> Self {
        Self::unchecked(PacketKind::ConnectOk, channel, None, payload)
    }

    pub fn event(channel: impl Into<String>, event: &str, args: Vec<Value>) -> Self {
        Self::unchecked(PacketKind::Event, channel, None, with_event(event, args))
    }

    pub fn ack_request(
        channel: impl Into<String>,
        correlation_id: u64,
        event: &str,
        args: Vec<Value>,
    ) -> Self {
        Self::unchecked(
            PacketKind::AckRequest,
            channel,
            Some(correlation_id),
            with_event(event, args),
        )
    }

    pub fn ack_reply(channel: impl Into<String>, correlation_id: u64, args: Vec<Value>) -> Self {
        Self::unchecked(PacketKind::AckReply, channel, Some(correlation_id), args)
    }

    pub fn disconnect(channel: impl Into<String>) -> Self {
        Self::unchecked(PacketKind::Disconnect, channel, None, Vec::new())
    }

    pub fn error(channel: impl Into<String>, message: &str) -> Self {
        Self::unchecked(
            PacketKind::Error,
            channel,
            None,
            vec![Value::from(message)],
        )
    }

    pub fn ping() -> Self {
        Self::unchecked(PacketKind::Ping, DEFAULT_CHANNEL, None, Vec::new())
    }

    pub fn pong() -> Self {
        Self::unchecked(PacketKind::Pong, DEFAULT_CHANNEL, None, Vec::new())
    }

    fn unchecked(
        kind: PacketKind,
        channel: impl Into<String>,
        correlation_id: Option<u64>,
        payload: Vec<Value>,
    ) -> Self {
        Self {
            kind,
            channel: channel.into(),
            correlation_id,
            payload,
        }
    }

    /// Check the structural invariants shared by encode and decode.
    pub fn validate(&self) -> Result<()> {
        if self.channel.is_empty() {
            return Err(ProtocolError::MissingChannel);
        }
        match (self.kind.requires_correlation(), self.correlation_id) {
            (true, None) => return Err(ProtocolError::MissingCorrelation(self.kind)),
            (false, Some(_)) => return Err(ProtocolError::UnexpectedCorrelation(self.kind)),
            _ => {}
        }
        if self.kind.carries_event_name() && self.event_name().is_none() {
            return Err(ProtocolError::MissingEventName(self.kind));
        }
        Ok(())
    }

    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn correlation_id(&self) -> Option<u64> {
        self.correlation_id
    }

    pub fn payload(&self) -> &[Value] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<Value> {
        self.payload
    }

    /// The event name of an EVENT or ACK_REQUEST frame.
    pub fn event_name(&self) -> Option<&str> {
        if !self.kind.carries_event_name() {
            return None;
        }
        self.payload
            .first()
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
    }

    /// Positional arguments following the event name.
    pub fn args(&self) -> &[Value] {
        if self.event_name().is_some() {
            &self.payload[1..]
        } else {
            &self.payload
        }
    }

    /// Split an event-carrying frame into `(name, args)`.
    pub fn into_event(self) -> Option<(String, Vec<Value>)> {
        if !self.kind.carries_event_name() {
            return None;
        }
        let mut payload = self.payload.into_iter();
        match payload.next() {
            Some(Value::String(name)) if !name.is_empty() => Some((name, payload.collect())),
            _ => None,
        }
    }

    /// First payload element as text, used by ERROR frames.
    pub fn message(&self) -> Option<&str> {
        self.payload.first().and_then(Value::as_str)
    }
}

fn with_event(event: &str, args: Vec<Value>) -> Vec<Value> {
    let mut payload = Vec::with_capacity(args.len() + 1);
    payload.push(Value::from(event));
    payload.extend(args);
    payload
}

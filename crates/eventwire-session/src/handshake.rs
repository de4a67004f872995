use std::fmt;
use std::time::Duration;

use bytes::BytesMut;
use eventwire_codec::{Codec, Value};
use eventwire_frame::{decode_frame, encode_frame, Frame, FrameConfig, PacketKind, DEFAULT_CHANNEL};
use eventwire_transport::Transport;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::auth::ChannelGate;
use crate::error::{Result, SessionError};

pub const PROTOCOL_NAME: &str = "eventwire";
pub const PROTOCOL_VERSION: &str = "1.0";

const MAX_PROTOCOL_LEN: usize = 32;
const MAX_VERSION_LEN: usize = 16;
const MAX_SID_LEN: usize = 128;
const MAX_AUTH_TOKEN_LEN: usize = 4096;

/// Payload of the CONNECT frame on the default channel.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectRequest {
    pub protocol: String,
    pub version: String,
    /// Opaque credential. Redacted in debug output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
}

/// Payload of the CONNECT_OK frame on the default channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectAccept {
    pub sid: String,
    pub version: String,
    /// Milliseconds between client pings. Absent disables pings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping_interval: Option<u64>,
    /// Milliseconds of grace after a missed ping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping_timeout: Option<u64>,
}

/// Negotiated metadata for one connection instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub sid: String,
    /// Remote address as the transport describes it.
    pub peer: String,
    pub protocol_version: String,
    pub ping_interval: Option<Duration>,
    pub ping_timeout: Duration,
    pub codec: &'static str,
    /// 1 for the first connection instance, incremented on every reconnect.
    pub epoch: u64,
}

/// Handshake settings shared by client and server.
#[derive(Clone)]
pub struct HandshakeConfig {
    /// Deadline for connecting plus the CONNECT / CONNECT_OK exchange.
    pub timeout: Duration,
    pub protocol_name: String,
    pub protocol_version: String,
    /// Sent by clients in CONNECT frames. Never logged.
    pub auth_token: Option<String>,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            protocol_name: PROTOCOL_NAME.to_string(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            auth_token: None,
        }
    }
}

fn redacted(token: &Option<String>) -> String {
    match token {
        Some(token) => format!("<redacted:{} bytes>", token.len()),
        None => "None".to_string(),
    }
}

impl fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("protocol", &self.protocol)
            .field("version", &self.version)
            .field("auth", &format_args!("{}", redacted(&self.auth)))
            .finish()
    }
}

impl fmt::Debug for HandshakeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeConfig")
            .field("timeout", &self.timeout)
            .field("protocol_name", &self.protocol_name)
            .field("protocol_version", &self.protocol_version)
            .field("auth_token", &format_args!("{}", redacted(&self.auth_token)))
            .finish()
    }
}

/// Payload for a channel CONNECT frame: `[{auth}]` when a token is set.
pub(crate) fn channel_connect_payload(auth: Option<&str>) -> Vec<Value> {
    match auth {
        Some(token) => {
            let mut map = std::collections::BTreeMap::new();
            map.insert("auth".to_string(), Value::from(token));
            vec![Value::Map(map)]
        }
        None => Vec::new(),
    }
}

/// Auth token carried by a CONNECT frame, if any.
pub(crate) fn connect_auth(frame: &Frame) -> Option<&str> {
    frame
        .payload()
        .first()
        .and_then(|v| v.get("auth"))
        .and_then(Value::as_str)
}

/// Client side: send CONNECT on `"/"` and wait for CONNECT_OK.
pub(crate) async fn client_handshake(
    transport: &mut Transport,
    codec: &dyn Codec,
    frame_config: &FrameConfig,
    config: &HandshakeConfig,
) -> Result<ConnectAccept> {
    validate_protocol_name(&config.protocol_name)?;
    validate_version(&config.protocol_version)?;
    validate_auth_token(config.auth_token.as_deref())?;

    let request = ConnectRequest {
        protocol: config.protocol_name.clone(),
        version: config.protocol_version.clone(),
        auth: config.auth_token.clone(),
    };
    let frame = Frame::connect(DEFAULT_CHANNEL, vec![Value::from_serialize(&request)?]);
    send_frame(transport, &frame, codec, frame_config).await?;

    let reply = recv_frame(transport, codec, frame_config, config.timeout).await?;
    if reply.channel() != DEFAULT_CHANNEL {
        return Err(SessionError::Handshake(format!(
            "expected reply on {DEFAULT_CHANNEL}, got {}",
            reply.channel()
        )));
    }
    match reply.kind() {
        PacketKind::ConnectOk => {}
        PacketKind::Error => {
            return Err(SessionError::Handshake(
                reply.message().unwrap_or("connection refused").to_string(),
            ));
        }
        other => {
            return Err(SessionError::Handshake(format!(
                "unexpected {other} before CONNECT_OK"
            )));
        }
    }

    let accept: ConnectAccept = reply
        .payload()
        .first()
        .ok_or_else(|| SessionError::Handshake("empty CONNECT_OK payload".to_string()))?
        .deserialize_into()
        .map_err(|err| SessionError::Handshake(format!("invalid CONNECT_OK payload: {err}")))?;

    validate_version(&accept.version)?;
    validate_sid(&accept.sid)?;
    if !is_version_compatible(&config.protocol_version, &accept.version)? {
        return Err(SessionError::Handshake(format!(
            "incompatible version '{}' (local '{}')",
            accept.version, config.protocol_version
        )));
    }

    debug!(sid = %accept.sid, version = %accept.version, "client handshake complete");
    Ok(accept)
}

/// Server side: wait for CONNECT on `"/"`, admit it through `gate`, answer
/// CONNECT_OK. Rejections are reported to the client with an ERROR frame.
pub(crate) async fn server_handshake(
    transport: &mut Transport,
    codec: &dyn Codec,
    frame_config: &FrameConfig,
    config: &HandshakeConfig,
    gate: &ChannelGate,
    accept: ConnectAccept,
) -> Result<ConnectRequest> {
    validate_protocol_name(&config.protocol_name)?;
    validate_version(&config.protocol_version)?;
    validate_sid(&accept.sid)?;

    let frame = recv_frame(transport, codec, frame_config, config.timeout).await?;
    let outcome = check_connect(&frame, config).and_then(|request| {
        gate.admit(DEFAULT_CHANNEL, request.auth.as_deref())
            .map(|()| request)
            .map_err(SessionError::Handshake)
    });

    match outcome {
        Ok(request) => {
            let reply = Frame::connect_ok(DEFAULT_CHANNEL, vec![Value::from_serialize(&accept)?]);
            send_frame(transport, &reply, codec, frame_config).await?;
            debug!(sid = %accept.sid, version = %request.version, "server handshake complete");
            Ok(request)
        }
        Err(err) => {
            let message = match &err {
                SessionError::Handshake(message) => message.clone(),
                other => other.to_string(),
            };
            warn!(peer = %transport.peer, %message, "rejecting connection");
            let reply = Frame::error(DEFAULT_CHANNEL, &message);
            if let Err(send_err) = send_frame(transport, &reply, codec, frame_config).await {
                debug!(error = %send_err, "failed to deliver handshake rejection");
            }
            let _ = transport.sink.close().await;
            Err(err)
        }
    }
}

fn check_connect(frame: &Frame, config: &HandshakeConfig) -> Result<ConnectRequest> {
    if frame.kind() != PacketKind::Connect || frame.channel() != DEFAULT_CHANNEL {
        return Err(SessionError::Handshake(format!(
            "expected CONNECT on {DEFAULT_CHANNEL}, got {} on {}",
            frame.kind(),
            frame.channel()
        )));
    }
    let request: ConnectRequest = frame
        .payload()
        .first()
        .ok_or_else(|| SessionError::Handshake("empty CONNECT payload".to_string()))?
        .deserialize_into()
        .map_err(|err| SessionError::Handshake(format!("invalid CONNECT payload: {err}")))?;

    validate_protocol_name(&request.protocol)?;
    validate_version(&request.version)?;
    validate_auth_token(request.auth.as_deref())?;

    if request.protocol != config.protocol_name {
        return Err(SessionError::Handshake(format!(
            "unknown protocol '{}' (expected '{}')",
            request.protocol, config.protocol_name
        )));
    }
    if !is_version_compatible(&request.version, &config.protocol_version)? {
        return Err(SessionError::Handshake(format!(
            "incompatible version '{}' (server '{}')",
            request.version, config.protocol_version
        )));
    }
    Ok(request)
}

pub(crate) async fn send_frame(
    transport: &mut Transport,
    frame: &Frame,
    codec: &dyn Codec,
    frame_config: &FrameConfig,
) -> Result<()> {
    let mut buf = BytesMut::new();
    encode_frame(frame, codec, frame_config, &mut buf)?;
    transport.sink.send(buf.freeze()).await?;
    Ok(())
}

pub(crate) async fn recv_frame(
    transport: &mut Transport,
    codec: &dyn Codec,
    frame_config: &FrameConfig,
    timeout: Duration,
) -> Result<Frame> {
    let message = tokio::time::timeout(timeout, transport.stream.recv())
        .await
        .map_err(|_| SessionError::Timeout(timeout))??;
    let message = message.ok_or_else(|| {
        SessionError::Connect("connection closed during handshake".to_string())
    })?;
    Ok(decode_frame(&message, codec, frame_config)?)
}

fn validate_protocol_name(protocol: &str) -> Result<()> {
    if protocol.is_empty() || protocol.len() > MAX_PROTOCOL_LEN {
        return Err(SessionError::Handshake(format!(
            "invalid protocol name length: {}",
            protocol.len()
        )));
    }
    Ok(())
}

fn validate_version(version: &str) -> Result<()> {
    if version.is_empty() || version.len() > MAX_VERSION_LEN {
        return Err(SessionError::Handshake(format!(
            "invalid protocol version length: {}",
            version.len()
        )));
    }
    parse_version(version).map(|_| ())
}

fn validate_sid(sid: &str) -> Result<()> {
    if sid.is_empty() || sid.len() > MAX_SID_LEN {
        return Err(SessionError::Handshake(format!(
            "invalid sid length: {}",
            sid.len()
        )));
    }
    Ok(())
}

fn validate_auth_token(auth: Option<&str>) -> Result<()> {
    if let Some(token) = auth {
        if token.is_empty() || token.len() > MAX_AUTH_TOKEN_LEN {
            return Err(SessionError::Handshake(format!(
                "invalid auth token length: {}",
                token.len()
            )));
        }
    }
    Ok(())
}

/// Same major, and the client minor is at least the server minor.
pub fn is_version_compatible(client_version: &str, server_version: &str) -> Result<bool> {
    let (client_major, client_minor) = parse_version(client_version)?;
    let (server_major, server_minor) = parse_version(server_version)?;
    Ok(client_major == server_major && client_minor >= server_minor)
}

fn parse_version(version: &str) -> Result<(u16, u16)> {
    let invalid = |why: &str| SessionError::Handshake(format!("invalid version '{version}': {why}"));
    let mut parts = version.split('.');
    let major = parts.next().ok_or_else(|| invalid("missing major"))?;
    let minor = parts.next().ok_or_else(|| invalid("missing minor"))?;
    if parts.next().is_some() {
        return Err(invalid("expected '<major>.<minor>'"));
    }
    let major = major.parse::<u16>().map_err(|_| invalid("non-numeric major"))?;
    let minor = minor.parse::<u16>().map_err(|_| invalid("non-numeric minor"))?;
    Ok((major, minor))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use eventwire_codec::JsonCodec;
    use eventwire_transport::memory;

    use super::*;
    use crate::auth::AllowAll;

    fn accept(sid: &str) -> ConnectAccept {
        ConnectAccept {
            sid: sid.to_string(),
            version: PROTOCOL_VERSION.to_string(),
            ping_interval: Some(25_000),
            ping_timeout: Some(20_000),
        }
    }

    #[tokio::test]
    async fn successful_handshake() {
        let (mut client, mut server) = memory::pair();
        let frame_config = FrameConfig::default();
        let config = HandshakeConfig {
            auth_token: Some("token".to_string()),
            ..HandshakeConfig::default()
        };
        let gate = ChannelGate::default();

        let default_config = HandshakeConfig::default();
        let (client_result, server_result) = tokio::join!(
            client_handshake(&mut client, &JsonCodec, &frame_config, &config),
            server_handshake(
                &mut server,
                &JsonCodec,
                &frame_config,
                &default_config,
                &gate,
                accept("sock-1"),
            )
        );
        let accepted = client_result.unwrap();
        let request = server_result.unwrap();
        assert_eq!(accepted, accept("sock-1"));
        assert_eq!(request.auth.as_deref(), Some("token"));
        assert_eq!(request.protocol, PROTOCOL_NAME);
    }

    #[tokio::test]
    async fn rejected_auth_reaches_client_as_error() {
        let (mut client, mut server) = memory::pair();
        let frame_config = FrameConfig::default();
        let gate = ChannelGate::new(
            None,
            Arc::new(|_: &str, auth: Option<&str>| {
                if auth == Some("good") {
                    Ok(())
                } else {
                    Err("bad credentials".to_string())
                }
            }),
        );

        let default_config = HandshakeConfig::default();
        let (client_result, server_result) = tokio::join!(
            client_handshake(&mut client, &JsonCodec, &frame_config, &default_config),
            server_handshake(
                &mut server,
                &JsonCodec,
                &frame_config,
                &default_config,
                &gate,
                accept("sock-2"),
            )
        );
        match client_result {
            Err(SessionError::Handshake(message)) => assert_eq!(message, "bad credentials"),
            other => panic!("expected handshake rejection, got {other:?}"),
        }
        assert!(matches!(server_result, Err(SessionError::Handshake(_))));
    }

    #[tokio::test]
    async fn wrong_protocol_name_rejected() {
        let (mut client, mut server) = memory::pair();
        let frame_config = FrameConfig::default();
        let config = HandshakeConfig {
            protocol_name: "foobar".to_string(),
            ..HandshakeConfig::default()
        };
        let gate = ChannelGate::new(Some(BTreeSet::new()), Arc::new(AllowAll));

        let default_config = HandshakeConfig::default();
        let (client_result, server_result) = tokio::join!(
            client_handshake(&mut client, &JsonCodec, &frame_config, &config),
            server_handshake(
                &mut server,
                &JsonCodec,
                &frame_config,
                &default_config,
                &gate,
                accept("sock-3"),
            )
        );
        assert!(matches!(client_result, Err(SessionError::Handshake(_))));
        assert!(matches!(server_result, Err(SessionError::Handshake(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_server_times_out() {
        let (mut client, _server) = memory::pair();
        let config = HandshakeConfig {
            timeout: Duration::from_millis(25),
            ..HandshakeConfig::default()
        };
        let result = client_handshake(&mut client, &JsonCodec, &FrameConfig::default(), &config).await;
        assert!(matches!(result, Err(SessionError::Timeout(_))));
    }

    #[test]
    fn version_compatibility() {
        assert!(is_version_compatible("1.0", "1.0").unwrap());
        assert!(is_version_compatible("1.2", "1.1").unwrap());
        assert!(!is_version_compatible("1.0", "1.1").unwrap());
        assert!(!is_version_compatible("2.0", "1.0").unwrap());
        assert!(is_version_compatible("1", "1.0").is_err());
        assert!(is_version_compatible("1.x", "1.0").is_err());
        assert!(is_version_compatible("1.0.0", "1.0").is_err());
    }

    #[test]
    fn accept_payload_uses_camel_case() {
        let value = Value::from_serialize(&accept("sock-9")).unwrap();
        assert_eq!(value.get("pingInterval").and_then(Value::as_i64), Some(25_000));
        assert_eq!(value.get("sid").and_then(Value::as_str), Some("sock-9"));
    }

    #[test]
    fn debug_redacts_auth() {
        let config = HandshakeConfig {
            auth_token: Some("super-secret".to_string()),
            ..HandshakeConfig::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("<redacted:12 bytes>"));

        let request = ConnectRequest {
            protocol: PROTOCOL_NAME.to_string(),
            version: PROTOCOL_VERSION.to_string(),
            auth: Some("super-secret".to_string()),
        };
        assert!(!format!("{request:?}").contains("super-secret"));
    }

    #[test]
    fn channel_connect_payload_carries_auth() {
        assert!(channel_connect_payload(None).is_empty());
        let frame = Frame::connect("/chat", channel_connect_payload(Some("t0k")));
        assert_eq!(connect_auth(&frame), Some("t0k"));
    }
}
